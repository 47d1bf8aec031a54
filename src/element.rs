use crate::cursor::RecordCursor;
use crate::datatypes::{encode_zstring, tag_to_string};
use crate::formid::{FormId, FormIdArena};
use crate::prototype::Prototype;
use crate::strings::StringTableSet;
use crate::utils::EspError;
use std::sync::Arc;

/// 子记录块：4字符标签 + u16长度 + 载荷
#[derive(Debug, Clone, PartialEq)]
pub struct SubChunk {
    pub tag: [u8; 4],
    pub data: Vec<u8>,
}

/// 写出一个子记录块
pub fn write_chunk(out: &mut Vec<u8>, tag: &[u8; 4], data: &[u8]) -> Result<(), EspError> {
    if data.len() > u16::MAX as usize {
        return Err(EspError::malformed(
            tag_to_string(tag),
            format!("subrecord payload too large: {} bytes", data.len()),
        ));
    }
    out.extend_from_slice(tag);
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// 记录载荷切块后的顺序块流
///
/// 容器解析从这里窥视下一个标签并按原型分发。
#[derive(Debug)]
pub struct ChunkStream {
    chunks: Vec<SubChunk>,
    pos: usize,
}

impl ChunkStream {
    /// 把记录载荷切分为子记录块序列
    ///
    /// 末尾不足一个块头的 NULL 填充按填充跳过，非 NULL 尾部数据报错。
    pub fn from_payload(payload: &[u8], record_type: &str) -> Result<Self, EspError> {
        let mut cursor = RecordCursor::new(payload, record_type);
        let mut chunks = Vec::new();

        while !cursor.is_done() {
            if cursor.remaining() < 6 {
                let rest = cursor.extract_rest();
                if rest.iter().all(|&b| b == 0) {
                    break; // NULL 填充
                }
                return Err(EspError::malformed(
                    record_type,
                    format!("{} trailing non-NULL bytes after last subrecord", rest.len()),
                ));
            }
            let tag = cursor.extract_tag()?;
            let size = cursor.extract_u16()? as usize;
            let data = cursor.extract_bytes(size)?.to_vec();
            chunks.push(SubChunk { tag, data });
        }

        Ok(ChunkStream { chunks, pos: 0 })
    }

    pub fn peek(&self) -> Option<&SubChunk> {
        self.chunks.get(self.pos)
    }

    pub fn next_chunk(&mut self) -> Option<&SubChunk> {
        let chunk = self.chunks.get(self.pos);
        if chunk.is_some() {
            self.pos += 1;
        }
        chunk
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.chunks.len()
    }
}

/// 标量字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    /// 32位打包引用，解析时经 FormIdArena 驻留
    FormId,
    /// null终止字符串
    ZString,
    /// 本地化字符串：本地化插件存 string-id，否则内联文本
    LString,
    /// 标志字，按位参与合并
    Flags8,
    Flags16,
    Flags32,
    /// 原样保留的尾部字节（必须是最后一个字段）
    Tail,
}

/// 标量字段描述
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: ValueKind,
    /// 可选尾字段：旧格式文件中缺失，导出时随之省略
    pub optional_tail: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: ValueKind) -> Self {
        FieldSpec {
            name,
            kind,
            optional_tail: false,
        }
    }

    pub fn optional(name: &'static str, kind: ValueKind) -> Self {
        FieldSpec {
            name,
            kind,
            optional_tail: true,
        }
    }
}

/// 本地化字符串值
#[derive(Debug, Clone, PartialEq)]
pub struct LString {
    /// STRING 表中的 string-id，0 表示内联
    pub id: u32,
    pub text: Option<String>,
}

/// 标量字段值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
    FormId(FormId),
    String(String),
    LString(LString),
    Flags(u32),
    Bytes(Vec<u8>),
}

/// 列表合并语义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMerge {
    /// 无序按身份键合并，键取条目第 key_field 个标量字段
    Keyed { key_field: usize },
    /// 有序列表整体替换（new != base 时采用 new）
    Replace,
}

/// 标记变体：标记标签 + 其后载荷所属的原型
#[derive(Debug, Clone)]
pub struct MarkerVariant {
    pub marker: [u8; 4],
    pub proto: Arc<Prototype>,
}

/// 变体构造描述（原型槽位持有，实例化时共享）
#[derive(Debug, Clone)]
pub enum ElementSpec {
    Scalar {
        fields: Vec<FieldSpec>,
    },
    Shell {
        proto: Arc<Prototype>,
    },
    List {
        entry: Arc<ElementSpec>,
        merge: ListMerge,
    },
    CountedList {
        counter_tag: [u8; 4],
        counter_width: usize,
        entry_tag: [u8; 4],
        entry: Arc<ElementSpec>,
        merge: ListMerge,
    },
    MarkerSet {
        variants: Vec<MarkerVariant>,
    },
    Bulk {
        family: Vec<[u8; 4]>,
    },
}

/// 解析上下文（显式传递，不依赖进程级全局状态）
pub struct ParseCtx<'a> {
    pub masters: &'a [String],
    pub plugin_name: &'a str,
    pub arena: &'a mut FormIdArena,
    pub localized: bool,
    pub strings: Option<&'a StringTableSet>,
    pub record_type: String,
}

/// 导出上下文
pub struct ExportCtx<'a> {
    pub masters: &'a [String],
    pub plugin_name: &'a str,
    pub arena: &'a FormIdArena,
    pub localized: bool,
    pub record_type: String,
}

/// 子记录变体（标签联合，无继承层级）
///
/// 每个变体实现同一组能力：parse / export / is_valid / visit_form_ids。
#[derive(Debug, Clone)]
pub enum Element {
    Scalar(ScalarElement),
    Shell(ShellElement),
    List(ListElement),
    CountedList(CountedListElement),
    MarkerSet(MarkerSetElement),
    Bulk(BulkElement),
}

impl Element {
    /// 按描述实例化空变体
    pub fn from_spec(spec: &ElementSpec) -> Element {
        match spec {
            ElementSpec::Scalar { fields } => Element::Scalar(ScalarElement {
                fields: fields.clone(),
                tag_seen: None,
                values: Vec::new(),
            }),
            ElementSpec::Shell { proto } => Element::Shell(ShellElement {
                inner: proto.instantiate(),
            }),
            ElementSpec::List { entry, merge } => Element::List(ListElement {
                entry_spec: Arc::clone(entry),
                merge: *merge,
                entries: Vec::new(),
            }),
            ElementSpec::CountedList {
                counter_tag,
                counter_width,
                entry_tag,
                entry,
                merge,
            } => Element::CountedList(CountedListElement {
                counter_tag: *counter_tag,
                counter_width: *counter_width,
                entry_tag: *entry_tag,
                entry_spec: Arc::clone(entry),
                merge: *merge,
                counter_seen: false,
                parsed_count: 0,
                entries: Vec::new(),
            }),
            ElementSpec::MarkerSet { variants } => Element::MarkerSet(MarkerSetElement {
                variants: variants.clone(),
                active: None,
            }),
            ElementSpec::Bulk { family } => Element::Bulk(BulkElement {
                family: family.clone(),
                chunks: Vec::new(),
            }),
        }
    }

    /// 已填充元素是否还接受当前标签的更多数据
    ///
    /// Scalar 一经填充即拒绝（重复标签交还控制权，外层据此开启新条目）；
    /// 列表类变体总是接受；Shell 递归询问内部容器。
    pub fn accepts_more(&self, tag: &[u8; 4]) -> bool {
        match self {
            Element::Scalar(s) => s.values.is_empty(),
            Element::Shell(sh) => sh.inner.would_accept(tag),
            Element::List(_)
            | Element::CountedList(_)
            | Element::MarkerSet(_)
            | Element::Bulk(_) => true,
        }
    }

    /// 是否已被填充（决定非强制槽位是否导出）
    pub fn is_valid(&self) -> bool {
        match self {
            Element::Scalar(s) => !s.values.is_empty(),
            Element::Shell(sh) => sh.inner.has_valid(),
            Element::List(l) => !l.entries.is_empty(),
            Element::CountedList(c) => c.counter_seen || !c.entries.is_empty(),
            Element::MarkerSet(m) => m.active.is_some(),
            Element::Bulk(b) => !b.chunks.is_empty(),
        }
    }

    /// 从块流解析一次分发
    pub fn parse(&mut self, stream: &mut ChunkStream, ctx: &mut ParseCtx<'_>) -> Result<(), EspError> {
        match self {
            Element::Scalar(s) => s.parse(stream, ctx),
            Element::Shell(sh) => sh.parse(stream, ctx),
            Element::List(l) => l.parse(stream, ctx),
            Element::CountedList(c) => c.parse(stream, ctx),
            Element::MarkerSet(m) => m.parse(stream, ctx),
            Element::Bulk(b) => b.parse(stream),
        }
    }

    /// 按声明布局导出为子记录块序列
    pub fn export(
        &self,
        out: &mut Vec<u8>,
        ctx: &ExportCtx<'_>,
        primary_tag: [u8; 4],
    ) -> Result<(), EspError> {
        match self {
            Element::Scalar(s) => s.export(out, ctx, primary_tag),
            Element::Shell(sh) => sh.inner.export(out, ctx),
            Element::List(l) => {
                for entry in &l.entries {
                    entry.export(out, ctx, primary_tag)?;
                }
                Ok(())
            }
            Element::CountedList(c) => c.export(out, ctx),
            Element::MarkerSet(m) => m.export(out, ctx),
            Element::Bulk(b) => {
                for chunk in &b.chunks {
                    write_chunk(out, &chunk.tag, &chunk.data)?;
                }
                Ok(())
            }
        }
    }

    /// 遍历包含的全部引用
    pub fn visit_form_ids(&self, f: &mut dyn FnMut(FormId)) {
        match self {
            Element::Scalar(s) => {
                for v in &s.values {
                    if let Value::FormId(fid) = v {
                        f(*fid);
                    }
                }
            }
            Element::Shell(sh) => sh.inner.visit_form_ids(f),
            Element::List(l) => {
                for e in &l.entries {
                    e.visit_form_ids(f);
                }
            }
            Element::CountedList(c) => {
                for e in &c.entries {
                    e.visit_form_ids(f);
                }
            }
            Element::MarkerSet(m) => {
                if let Some(active) = &m.active {
                    active.body.visit_form_ids(f);
                }
            }
            Element::Bulk(_) => {}
        }
    }

    /// 可变遍历（批量引用改写时使用）
    pub fn visit_form_ids_mut(&mut self, f: &mut dyn FnMut(&mut FormId)) {
        match self {
            Element::Scalar(s) => {
                for v in &mut s.values {
                    if let Value::FormId(fid) = v {
                        f(fid);
                    }
                }
            }
            Element::Shell(sh) => sh.inner.visit_form_ids_mut(f),
            Element::List(l) => {
                for e in &mut l.entries {
                    e.visit_form_ids_mut(f);
                }
            }
            Element::CountedList(c) => {
                for e in &mut c.entries {
                    e.visit_form_ids_mut(f);
                }
            }
            Element::MarkerSet(m) => {
                if let Some(active) = &mut m.active {
                    active.body.visit_form_ids_mut(f);
                }
            }
            Element::Bulk(_) => {}
        }
    }
}

/// 标量变体：一个带标签的块，内部是固定字段序列
#[derive(Debug, Clone)]
pub struct ScalarElement {
    pub fields: Vec<FieldSpec>,
    /// 实际解析到的标签（标签别名槽位按读入的写回）
    pub tag_seen: Option<[u8; 4]>,
    /// 已填充的字段值；少于字段总数即"旧格式"标记，导出时省略尾字段
    pub values: Vec<Value>,
}

impl ScalarElement {
    fn parse(&mut self, stream: &mut ChunkStream, ctx: &mut ParseCtx<'_>) -> Result<(), EspError> {
        let chunk = stream
            .next_chunk()
            .ok_or_else(|| EspError::malformed(ctx.record_type.clone(), "scalar slot at end of stream"))?;
        let tag = chunk.tag;
        let data = chunk.data.clone();
        let mut cursor = RecordCursor::new(&data, ctx.record_type.clone());

        self.tag_seen = Some(tag);
        self.values.clear();

        for (i, field) in self.fields.iter().enumerate() {
            if cursor.is_done() {
                // 声明长度已消耗完：剩余字段必须全部是可选尾字段
                for missing in &self.fields[i..] {
                    if !missing.optional_tail {
                        return Err(EspError::malformed(
                            ctx.record_type.clone(),
                            format!(
                                "{}: payload ended before required field '{}'",
                                tag_to_string(&tag),
                                missing.name
                            ),
                        ));
                    }
                }
                break;
            }
            let value = read_value(field, &mut cursor, ctx)?;
            self.values.push(value);
        }

        cursor.expect_done()
    }

    fn export(
        &self,
        out: &mut Vec<u8>,
        ctx: &ExportCtx<'_>,
        primary_tag: [u8; 4],
    ) -> Result<(), EspError> {
        let mut payload = Vec::new();
        for (field, value) in self.fields.iter().zip(self.values.iter()) {
            write_value(&mut payload, field, value, ctx)?;
        }
        write_chunk(out, &self.tag_seen.unwrap_or(primary_tag), &payload)
    }

    /// 已填充字段数（小于字段总数即旧格式载荷）
    pub fn present(&self) -> usize {
        self.values.len()
    }

    /// 是否为旧格式载荷（缺少可选尾字段）
    pub fn is_legacy(&self) -> bool {
        !self.values.is_empty() && self.values.len() < self.fields.len()
    }
}

fn read_value(
    field: &FieldSpec,
    cursor: &mut RecordCursor<'_>,
    ctx: &mut ParseCtx<'_>,
) -> Result<Value, EspError> {
    Ok(match field.kind {
        ValueKind::I8 => Value::I8(cursor.extract_i8()?),
        ValueKind::U8 => Value::U8(cursor.extract_u8()?),
        ValueKind::I16 => Value::I16(cursor.extract_i16()?),
        ValueKind::U16 => Value::U16(cursor.extract_u16()?),
        ValueKind::I32 => Value::I32(cursor.extract_i32()?),
        ValueKind::U32 => Value::U32(cursor.extract_u32()?),
        ValueKind::F32 => Value::F32(cursor.extract_f32()?),
        ValueKind::FormId => {
            let raw = cursor.extract_u32()?;
            Value::FormId(ctx.arena.resolve(raw, ctx.masters, ctx.plugin_name))
        }
        ValueKind::ZString => Value::String(cursor.extract_zstring().content),
        ValueKind::LString => {
            if ctx.localized {
                let id = cursor.extract_u32()?;
                let text = ctx.strings.and_then(|s| s.get(id)).map(|t| t.to_string());
                Value::LString(LString { id, text })
            } else {
                Value::LString(LString {
                    id: 0,
                    text: Some(cursor.extract_zstring().content),
                })
            }
        }
        ValueKind::Flags8 => Value::Flags(cursor.extract_u8()? as u32),
        ValueKind::Flags16 => Value::Flags(cursor.extract_u16()? as u32),
        ValueKind::Flags32 => Value::Flags(cursor.extract_u32()?),
        ValueKind::Tail => Value::Bytes(cursor.extract_rest().to_vec()),
    })
}

fn write_value(
    out: &mut Vec<u8>,
    field: &FieldSpec,
    value: &Value,
    ctx: &ExportCtx<'_>,
) -> Result<(), EspError> {
    match (field.kind, value) {
        (ValueKind::I8, Value::I8(v)) => out.push(*v as u8),
        (ValueKind::U8, Value::U8(v)) => out.push(*v),
        (ValueKind::I16, Value::I16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::U16, Value::U16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::I32, Value::I32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::U32, Value::U32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::F32, Value::F32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::FormId, Value::FormId(fid)) => {
            let raw = ctx.arena.unresolve(*fid, ctx.masters, ctx.plugin_name)?;
            out.extend_from_slice(&raw.to_le_bytes());
        }
        (ValueKind::ZString, Value::String(s)) => out.extend_from_slice(&encode_zstring(s)),
        (ValueKind::LString, Value::LString(ls)) => {
            if ctx.localized {
                out.extend_from_slice(&ls.id.to_le_bytes());
            } else {
                out.extend_from_slice(&encode_zstring(ls.text.as_deref().unwrap_or("")));
            }
        }
        (ValueKind::Flags8, Value::Flags(v)) => out.push(*v as u8),
        (ValueKind::Flags16, Value::Flags(v)) => out.extend_from_slice(&(*v as u16).to_le_bytes()),
        (ValueKind::Flags32, Value::Flags(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ValueKind::Tail, Value::Bytes(b)) => out.extend_from_slice(b),
        (kind, value) => {
            return Err(EspError::UnexpectedFieldValue {
                record_type: ctx.record_type.clone(),
                field: field.name.to_string(),
                value: format!("{:?} does not fit {:?}", value, kind),
            })
        }
    }
    Ok(())
}

/// 嵌套壳变体：无自身包装标签的有序嵌套组
#[derive(Debug, Clone)]
pub struct ShellElement {
    pub inner: SubrecordContainer,
}

impl ShellElement {
    fn parse(&mut self, stream: &mut ChunkStream, ctx: &mut ParseCtx<'_>) -> Result<(), EspError> {
        let consumed = self.inner.consume(stream, ctx)?;
        if consumed == 0 {
            let tag = stream.peek().map(|c| tag_to_string(&c.tag)).unwrap_or_default();
            return Err(EspError::malformed(
                ctx.record_type.clone(),
                format!("shell slot matched tag {} but consumed nothing", tag),
            ));
        }
        Ok(())
    }
}

/// 列表变体：同标签的零或多个重复条目
#[derive(Debug, Clone)]
pub struct ListElement {
    pub entry_spec: Arc<ElementSpec>,
    pub merge: ListMerge,
    pub entries: Vec<Element>,
}

impl ListElement {
    fn parse(&mut self, stream: &mut ChunkStream, ctx: &mut ParseCtx<'_>) -> Result<(), EspError> {
        let mut entry = Element::from_spec(&self.entry_spec);
        entry.parse(stream, ctx)?;
        self.entries.push(entry);
        Ok(())
    }
}

/// 计数列表变体：前导计数字段 + 重复条目
///
/// 计数字段是派生值：导出时一律按实际条目数重算，忽略解析到的值。
#[derive(Debug, Clone)]
pub struct CountedListElement {
    pub counter_tag: [u8; 4],
    pub counter_width: usize,
    pub entry_tag: [u8; 4],
    pub entry_spec: Arc<ElementSpec>,
    pub merge: ListMerge,
    pub counter_seen: bool,
    /// 解析到的原始计数（仅诊断用，非权威）
    pub parsed_count: u32,
    pub entries: Vec<Element>,
}

impl CountedListElement {
    fn parse(&mut self, stream: &mut ChunkStream, ctx: &mut ParseCtx<'_>) -> Result<(), EspError> {
        let tag = match stream.peek() {
            Some(c) => c.tag,
            None => return Ok(()),
        };
        if tag == self.counter_tag {
            if let Some(chunk) = stream.next_chunk() {
                let data = chunk.data.clone();
                let mut cursor = RecordCursor::new(&data, ctx.record_type.clone());
                self.parsed_count = cursor.extract_length(self.counter_width)?;
                cursor.expect_done()?;
                self.counter_seen = true;
            }
            Ok(())
        } else {
            let mut entry = Element::from_spec(&self.entry_spec);
            entry.parse(stream, ctx)?;
            self.entries.push(entry);
            Ok(())
        }
    }

    fn export(&self, out: &mut Vec<u8>, ctx: &ExportCtx<'_>) -> Result<(), EspError> {
        // 计数按实际长度重算
        let count = self.entries.len() as u32;
        let counter_payload = match self.counter_width {
            1 => vec![count as u8],
            2 => (count as u16).to_le_bytes().to_vec(),
            _ => count.to_le_bytes().to_vec(),
        };
        write_chunk(out, &self.counter_tag, &counter_payload)?;

        for entry in &self.entries {
            entry.export(out, ctx, self.entry_tag)?;
        }
        Ok(())
    }
}

/// 标记集变体：按最近一次出现的标记标签选择活动分支
///
/// 标记之后的载荷块属于该标记的分支，直到下一个标记或无关标签出现。
#[derive(Debug, Clone)]
pub struct MarkerSetElement {
    pub variants: Vec<MarkerVariant>,
    pub active: Option<ActiveVariant>,
}

/// 活动分支
#[derive(Debug, Clone)]
pub struct ActiveVariant {
    pub variant_index: usize,
    /// 标记块自身的载荷（通常为空，原样写回）
    pub marker_data: Vec<u8>,
    pub body: SubrecordContainer,
}

impl MarkerSetElement {
    fn parse(&mut self, stream: &mut ChunkStream, ctx: &mut ParseCtx<'_>) -> Result<(), EspError> {
        let chunk = stream
            .next_chunk()
            .ok_or_else(|| EspError::malformed(ctx.record_type.clone(), "marker slot at end of stream"))?;
        let tag = chunk.tag;
        let marker_data = chunk.data.clone();

        let variant_index = self
            .variants
            .iter()
            .position(|v| v.marker == tag)
            .ok_or_else(|| {
                EspError::malformed(
                    ctx.record_type.clone(),
                    format!("tag {} is not a marker of this set", tag_to_string(&tag)),
                )
            })?;

        // 后出现的标记重设活动分支
        let mut active = ActiveVariant {
            variant_index,
            marker_data,
            body: self.variants[variant_index].proto.instantiate(),
        };
        active.body.consume(stream, ctx)?;
        self.active = Some(active);
        Ok(())
    }

    fn export(&self, out: &mut Vec<u8>, ctx: &ExportCtx<'_>) -> Result<(), EspError> {
        if let Some(active) = &self.active {
            let marker = self.variants[active.variant_index].marker;
            write_chunk(out, &marker, &active.marker_data)?;
            active.body.export(out, ctx)?;
        }
        Ok(())
    }

    /// 当前活动的标记标签
    pub fn active_marker(&self) -> Option<[u8; 4]> {
        self.active
            .as_ref()
            .map(|a| self.variants[a.variant_index].marker)
    }
}

/// 批量变体：贪婪消耗同族标签的连续块，原样保留
#[derive(Debug, Clone)]
pub struct BulkElement {
    pub family: Vec<[u8; 4]>,
    pub chunks: Vec<SubChunk>,
}

impl BulkElement {
    fn parse(&mut self, stream: &mut ChunkStream) -> Result<(), EspError> {
        while let Some(chunk) = stream.peek() {
            if !self.family.contains(&chunk.tag) {
                break; // 未识别标签：交还控制权
            }
            let chunk = chunk.clone();
            stream.next_chunk();
            self.chunks.push(chunk);
        }
        Ok(())
    }
}

/// 子记录容器：原型驱动的顺序分发与有序导出
#[derive(Debug, Clone)]
pub struct SubrecordContainer {
    proto: Arc<Prototype>,
    elements: Vec<Option<Element>>,
}

impl SubrecordContainer {
    pub fn new(proto: Arc<Prototype>) -> Self {
        let elements = vec![None; proto.len()];
        SubrecordContainer { proto, elements }
    }

    pub fn proto(&self) -> &Arc<Prototype> {
        &self.proto
    }

    /// 反复窥视下一个标签并分发给对应槽位
    ///
    /// 当前位置的标签不被任何槽位接受时终止（控制权交还父容器）。
    /// 返回消耗的块数。
    pub fn consume(
        &mut self,
        stream: &mut ChunkStream,
        ctx: &mut ParseCtx<'_>,
    ) -> Result<usize, EspError> {
        let start = stream.position();

        while let Some(chunk) = stream.peek() {
            let tag = chunk.tag;
            let Some(idx) = self.proto.slot_for(&tag) else {
                break;
            };
            if let Some(existing) = &self.elements[idx] {
                if !existing.accepts_more(&tag) {
                    break;
                }
            }

            let spec = Arc::clone(&self.proto.slots()[idx].spec);
            let element = self.elements[idx].get_or_insert_with(|| Element::from_spec(&spec));

            let before = stream.position();
            element.parse(stream, ctx)?;
            if stream.position() == before {
                return Err(EspError::malformed(
                    ctx.record_type.clone(),
                    format!("slot for tag {} made no progress", tag_to_string(&tag)),
                ));
            }
        }

        Ok(stream.position() - start)
    }

    /// 某标签当前是否会被接受（Shell 的 accepts_more 递归到这里）
    pub fn would_accept(&self, tag: &[u8; 4]) -> bool {
        match self.proto.slot_for(tag) {
            Some(idx) => match &self.elements[idx] {
                Some(e) => e.accepts_more(tag),
                None => true,
            },
            None => false,
        }
    }

    /// 按原型声明顺序导出；槽位写出当且仅当已填充或强制导出
    pub fn export(&self, out: &mut Vec<u8>, ctx: &ExportCtx<'_>) -> Result<(), EspError> {
        for (slot, element) in self.proto.slots().iter().zip(self.elements.iter()) {
            let primary = slot.tags[0];
            match element {
                Some(e) if e.is_valid() || slot.force_export => e.export(out, ctx, primary)?,
                Some(_) => {}
                None if slot.force_export => {
                    Element::from_spec(&slot.spec).export(out, ctx, primary)?
                }
                None => {}
            }
        }
        Ok(())
    }

    /// O(1) 按标签取元素
    pub fn get(&self, tag: &[u8; 4]) -> Option<&Element> {
        let idx = self.proto.slot_for(tag)?;
        self.elements[idx].as_ref()
    }

    pub fn get_mut(&mut self, tag: &[u8; 4]) -> Option<&mut Element> {
        let idx = self.proto.slot_for(tag)?;
        self.elements[idx].as_mut()
    }

    /// 按槽位下标访问（合并引擎按槽位对齐遍历）
    pub fn element_at(&self, idx: usize) -> Option<&Element> {
        self.elements.get(idx).and_then(|e| e.as_ref())
    }

    pub fn element_at_mut(&mut self, idx: usize) -> &mut Option<Element> {
        &mut self.elements[idx]
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn has_valid(&self) -> bool {
        self.elements
            .iter()
            .flatten()
            .any(|e| e.is_valid())
    }

    /// 读取标量槽位的字段值
    pub fn scalar_values(&self, tag: &[u8; 4]) -> Option<&[Value]> {
        match self.get(tag) {
            Some(Element::Scalar(s)) => Some(&s.values),
            _ => None,
        }
    }

    /// 写入标量槽位（API 填充路径；不存在的标签返回 false）
    pub fn set_scalar(&mut self, tag: &[u8; 4], values: Vec<Value>) -> bool {
        let Some(idx) = self.proto.slot_for(tag) else {
            return false;
        };
        let spec = Arc::clone(&self.proto.slots()[idx].spec);
        let mut element = Element::from_spec(&spec);
        match &mut element {
            Element::Scalar(s) => {
                if values.len() > s.fields.len() {
                    return false;
                }
                s.values = values;
                s.tag_seen = Some(*tag);
            }
            _ => return false,
        }
        self.elements[idx] = Some(element);
        true
    }

    pub fn visit_form_ids(&self, f: &mut dyn FnMut(FormId)) {
        for e in self.elements.iter().flatten() {
            e.visit_form_ids(f);
        }
    }

    pub fn visit_form_ids_mut(&mut self, f: &mut dyn FnMut(&mut FormId)) {
        for e in self.elements.iter_mut().flatten() {
            e.visit_form_ids_mut(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prototype::{Prototype, Slot};

    fn chunk_bytes(tag: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_chunk(&mut out, tag, data).unwrap();
        out
    }

    fn ctx_parts() -> (Vec<String>, FormIdArena) {
        (vec!["Skyrim.esm".to_string()], FormIdArena::new())
    }

    fn parse_ctx<'a>(
        masters: &'a [String],
        arena: &'a mut FormIdArena,
    ) -> ParseCtx<'a> {
        ParseCtx {
            masters,
            plugin_name: "test.esp",
            arena,
            localized: false,
            strings: None,
            record_type: "TEST".to_string(),
        }
    }

    fn export_ctx<'a>(masters: &'a [String], arena: &'a FormIdArena) -> ExportCtx<'a> {
        ExportCtx {
            masters,
            plugin_name: "test.esp",
            arena,
            localized: false,
            record_type: "TEST".to_string(),
        }
    }

    fn stats_proto() -> Arc<Prototype> {
        // (value: i32, weight: f32) 固定8字节载荷
        let mut proto = Prototype::new();
        proto.append(Slot::new(
            "data",
            vec![*b"DATA"],
            ElementSpec::Scalar {
                fields: vec![
                    FieldSpec::required("value", ValueKind::I32),
                    FieldSpec::required("weight", ValueKind::F32),
                ],
            },
        ));
        Arc::new(proto)
    }

    #[test]
    fn test_scalar_fixed_payload_roundtrip() {
        // 概念场景：value=100, weight=1.5 的8字节载荷
        let mut payload = Vec::new();
        payload.extend_from_slice(&100i32.to_le_bytes());
        payload.extend_from_slice(&1.5f32.to_le_bytes());
        let bytes = chunk_bytes(b"DATA", &payload);

        let proto = stats_proto();
        let mut container = proto.instantiate();
        let (masters, mut arena) = ctx_parts();
        let mut stream = ChunkStream::from_payload(&bytes, "TEST").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        container.consume(&mut stream, &mut ctx).unwrap();

        let values = container.scalar_values(b"DATA").unwrap();
        assert_eq!(values[0], Value::I32(100));
        assert_eq!(values[1], Value::F32(1.5));

        let mut out = Vec::new();
        container.export(&mut out, &export_ctx(&masters, &arena)).unwrap();
        assert_eq!(out, bytes, "定长标量应该字节级往返一致");
    }

    #[test]
    fn test_optional_tail_legacy_format() {
        // 旧格式缺少尾部4字节字段
        let mut proto = Prototype::new();
        proto.append(Slot::new(
            "dnam",
            vec![*b"DNAM"],
            ElementSpec::Scalar {
                fields: vec![
                    FieldSpec::required("speed", ValueKind::F32),
                    FieldSpec::required("reach", ValueKind::F32),
                    FieldSpec::optional("crit_damage", ValueKind::U32),
                ],
            },
        ));
        let proto = Arc::new(proto);
        let (masters, mut arena) = ctx_parts();

        // 旧格式：8字节
        let mut old_payload = Vec::new();
        old_payload.extend_from_slice(&1.0f32.to_le_bytes());
        old_payload.extend_from_slice(&0.5f32.to_le_bytes());
        let old_bytes = chunk_bytes(b"DNAM", &old_payload);

        let mut container = proto.instantiate();
        let mut stream = ChunkStream::from_payload(&old_bytes, "TEST").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        container.consume(&mut stream, &mut ctx).unwrap();

        match container.get(b"DNAM") {
            Some(Element::Scalar(s)) => {
                assert!(s.is_legacy(), "缺少尾字段应置旧格式标记");
                assert_eq!(s.present(), 2);
            }
            _ => panic!("应该是标量元素"),
        }

        // 导出时省略尾字段
        let mut out = Vec::new();
        container.export(&mut out, &export_ctx(&masters, &arena)).unwrap();
        assert_eq!(out, old_bytes);

        // 新格式：12字节，尾字段保留
        let mut new_payload = old_payload.clone();
        new_payload.extend_from_slice(&7u32.to_le_bytes());
        let new_bytes = chunk_bytes(b"DNAM", &new_payload);

        let mut container = proto.instantiate();
        let mut stream = ChunkStream::from_payload(&new_bytes, "TEST").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        container.consume(&mut stream, &mut ctx).unwrap();

        let mut out = Vec::new();
        container.export(&mut out, &export_ctx(&masters, &arena)).unwrap();
        assert_eq!(out, new_bytes, "新格式应保留尾字段");
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let proto = stats_proto();
        let mut container = proto.instantiate();
        let (masters, mut arena) = ctx_parts();

        // 只有4字节，weight 缺失且非可选
        let bytes = chunk_bytes(b"DATA", &100i32.to_le_bytes());
        let mut stream = ChunkStream::from_payload(&bytes, "TEST").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);

        let result = container.consume(&mut stream, &mut ctx);
        assert!(matches!(result, Err(EspError::MalformedRecord { .. })));
    }

    #[test]
    fn test_counted_list_counter_recomputed() {
        // 概念场景：计数字段解析进来是过期值，导出按实际条目数重写
        let entry = Arc::new(ElementSpec::Scalar {
            fields: vec![FieldSpec::required("keyword", ValueKind::FormId)],
        });
        let mut proto = Prototype::new();
        proto.append(Slot::new(
            "keywords",
            vec![*b"KSIZ", *b"KWDA"],
            ElementSpec::CountedList {
                counter_tag: *b"KSIZ",
                counter_width: 4,
                entry_tag: *b"KWDA",
                entry,
                merge: ListMerge::Keyed { key_field: 0 },
            },
        ));
        let proto = Arc::new(proto);

        // 过期计数 9，实际3个条目
        let mut bytes = chunk_bytes(b"KSIZ", &9u32.to_le_bytes());
        for local in [0x100u32, 0x200, 0x300] {
            bytes.extend_from_slice(&chunk_bytes(b"KWDA", &local.to_le_bytes()));
        }

        let (masters, mut arena) = ctx_parts();
        let mut container = proto.instantiate();
        let mut stream = ChunkStream::from_payload(&bytes, "TEST").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        container.consume(&mut stream, &mut ctx).unwrap();

        let mut out = Vec::new();
        container.export(&mut out, &export_ctx(&masters, &arena)).unwrap();

        // 导出的计数应为3
        let mut expected = chunk_bytes(b"KSIZ", &3u32.to_le_bytes());
        for local in [0x100u32, 0x200, 0x300] {
            expected.extend_from_slice(&chunk_bytes(b"KWDA", &local.to_le_bytes()));
        }
        assert_eq!(out, expected, "计数字段必须按实际条目数重算");
    }

    #[test]
    fn test_marker_set_keyed_by_last_marker() {
        let mut skill_proto = Prototype::new();
        skill_proto.append(Slot::new(
            "skill",
            vec![*b"SKIL"],
            ElementSpec::Scalar {
                fields: vec![FieldSpec::required("actor_value", ValueKind::U32)],
            },
        ));
        let mut spell_proto = Prototype::new();
        spell_proto.append(Slot::new(
            "spell",
            vec![*b"SPEL"],
            ElementSpec::Scalar {
                fields: vec![FieldSpec::required("spell", ValueKind::FormId)],
            },
        ));

        let mut proto = Prototype::new();
        proto.append(Slot::new(
            "teaches",
            vec![*b"TCHS", *b"TCHP"],
            ElementSpec::MarkerSet {
                variants: vec![
                    MarkerVariant {
                        marker: *b"TCHS",
                        proto: Arc::new(skill_proto),
                    },
                    MarkerVariant {
                        marker: *b"TCHP",
                        proto: Arc::new(spell_proto),
                    },
                ],
            },
        ));
        let proto = Arc::new(proto);

        // 标记后跟随其分支载荷
        let mut bytes = chunk_bytes(b"TCHS", &[]);
        bytes.extend_from_slice(&chunk_bytes(b"SKIL", &6u32.to_le_bytes()));

        let (masters, mut arena) = ctx_parts();
        let mut container = proto.instantiate();
        let mut stream = ChunkStream::from_payload(&bytes, "BOOK").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        ctx.record_type = "BOOK".to_string();
        container.consume(&mut stream, &mut ctx).unwrap();

        match container.get(b"TCHS") {
            Some(Element::MarkerSet(m)) => {
                assert_eq!(m.active_marker(), Some(*b"TCHS"));
                let body = &m.active.as_ref().unwrap().body;
                assert_eq!(body.scalar_values(b"SKIL").unwrap()[0], Value::U32(6));
            }
            _ => panic!("应该是标记集元素"),
        }

        let mut out = Vec::new();
        container.export(&mut out, &export_ctx(&masters, &arena)).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_bulk_stops_at_unrecognized_tag() {
        let mut proto = Prototype::new();
        proto.append(Slot::new(
            "conditions",
            vec![*b"CTDA", *b"CIS1", *b"CIS2"],
            ElementSpec::Bulk {
                family: vec![*b"CTDA", *b"CIS1", *b"CIS2"],
            },
        ));
        let proto = Arc::new(proto);

        let mut bytes = chunk_bytes(b"CTDA", &[1, 2, 3, 4]);
        bytes.extend_from_slice(&chunk_bytes(b"CIS1", b"Var\0"));
        bytes.extend_from_slice(&chunk_bytes(b"CTDA", &[5, 6, 7, 8]));
        bytes.extend_from_slice(&chunk_bytes(b"ZZZZ", &[9])); // 族外标签

        let (masters, mut arena) = ctx_parts();
        let mut container = proto.instantiate();
        let mut stream = ChunkStream::from_payload(&bytes, "INFO").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        container.consume(&mut stream, &mut ctx).unwrap();

        // 贪婪消耗同族，族外标签处停止
        match container.get(b"CTDA") {
            Some(Element::Bulk(b)) => assert_eq!(b.chunks.len(), 3),
            _ => panic!("应该是批量元素"),
        }
        assert!(!stream.is_done(), "族外标签应留给父容器");
        assert_eq!(stream.peek().unwrap().tag, *b"ZZZZ");
    }

    #[test]
    fn test_list_of_shells_new_entry_on_repeated_tag() {
        let mut entry_proto = Prototype::new();
        entry_proto.append(Slot::new(
            "data",
            vec![*b"TRDT"],
            ElementSpec::Scalar {
                fields: vec![FieldSpec::required("emotion", ValueKind::U32)],
            },
        ));
        entry_proto.append(Slot::new(
            "text",
            vec![*b"NAM1"],
            ElementSpec::Scalar {
                fields: vec![FieldSpec::required("response", ValueKind::LString)],
            },
        ));
        let entry_proto = Arc::new(entry_proto);

        let mut proto = Prototype::new();
        proto.append(Slot::new(
            "responses",
            vec![*b"TRDT", *b"NAM1"],
            ElementSpec::List {
                entry: Arc::new(ElementSpec::Shell {
                    proto: entry_proto,
                }),
                merge: ListMerge::Replace,
            },
        ));
        let proto = Arc::new(proto);

        let mut bytes = chunk_bytes(b"TRDT", &1u32.to_le_bytes());
        bytes.extend_from_slice(&chunk_bytes(b"NAM1", b"Hello.\0"));
        bytes.extend_from_slice(&chunk_bytes(b"TRDT", &2u32.to_le_bytes()));
        bytes.extend_from_slice(&chunk_bytes(b"NAM1", b"Goodbye.\0"));

        let (masters, mut arena) = ctx_parts();
        let mut container = proto.instantiate();
        let mut stream = ChunkStream::from_payload(&bytes, "INFO").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        container.consume(&mut stream, &mut ctx).unwrap();

        match container.get(b"TRDT") {
            Some(Element::List(l)) => {
                assert_eq!(l.entries.len(), 2, "重复的起始标签应开启新条目");
            }
            _ => panic!("应该是列表元素"),
        }

        let mut out = Vec::new();
        container.export(&mut out, &export_ctx(&masters, &arena)).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_unmatched_tag_returns_control() {
        let proto = stats_proto();
        let mut container = proto.instantiate();
        let (masters, mut arena) = ctx_parts();

        let mut payload = Vec::new();
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&2.0f32.to_le_bytes());
        let mut bytes = chunk_bytes(b"DATA", &payload);
        bytes.extend_from_slice(&chunk_bytes(b"OTHR", &[1]));

        let mut stream = ChunkStream::from_payload(&bytes, "TEST").unwrap();
        let mut ctx = parse_ctx(&masters, &mut arena);
        let consumed = container.consume(&mut stream, &mut ctx).unwrap();

        assert_eq!(consumed, 1);
        assert_eq!(stream.peek().unwrap().tag, *b"OTHR", "未匹配标签交还父级");
    }

    #[test]
    fn test_null_padding_tolerated() {
        let mut bytes = chunk_bytes(b"DATA", &[0u8; 8]);
        bytes.extend_from_slice(&[0, 0, 0]); // 3字节NULL填充
        let stream = ChunkStream::from_payload(&bytes, "TEST").unwrap();
        assert_eq!(stream.chunks.len(), 1);
    }

    #[test]
    fn test_non_null_trailing_rejected() {
        let mut bytes = chunk_bytes(b"DATA", &[0u8; 8]);
        bytes.extend_from_slice(&[0xFF, 0xAA]);
        let result = ChunkStream::from_payload(&bytes, "TEST");
        assert!(result.is_err(), "非NULL尾部数据应该报错");
    }
}
