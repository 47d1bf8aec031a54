use crate::context::{LoadOrder, PatchContext};
use crate::cursor::RecordCursor;
use crate::datatypes::{encode_zstring, RawString, RecordFlags};
use crate::element::{
    write_chunk, ChunkStream, CountedListElement, Element, ExportCtx, ParseCtx, SubChunk, Value,
};
use crate::formid::{FormId, FormIdArena, FormKey};
use crate::group::{Group, GROUP_TYPE_TOP};
use crate::record::{Record, RecordBody};
use crate::records::{is_leveled_list, LEVELED_LIST_MAX_ENTRIES};
use crate::strings::StringTableSet;
use crate::utils::{create_backup, EspError};
use memmap2::Mmap;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// 新建插件的对象id计数起点（低位段保留给引擎）
const INITIAL_OBJECT_ID: u32 = 0x800;

/// 一个完整的插件文件
///
/// 顶层分组按首次出现顺序保存，`group_index` 按记录类型标签定位。
/// 所有引用句柄都属于本插件的驻留表 `arena`。
#[derive(Debug, Clone)]
pub struct Plugin {
    pub path: Option<PathBuf>,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub flags: u32,
    pub masters: Vec<String>,
    pub version: f32,
    pub next_object_id: u32,
    pub timestamp: u16,
    pub version_control_info: u16,
    pub internal_version: u16,
    pub header_unknown: u16,
    groups: Vec<Group>,
    group_index: HashMap<[u8; 4], usize>,
    pub arena: FormIdArena,
    /// TES4 里未建模的子记录（如 ONAM/INTV），导出时原样写回
    header_extra: Vec<SubChunk>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Plugin {
            path: None,
            name: name.into(),
            author: None,
            description: None,
            flags: 0,
            masters: Vec::new(),
            version: 1.71,
            next_object_id: INITIAL_OBJECT_ID,
            timestamp: 0,
            version_control_info: 0,
            internal_version: 44,
            header_unknown: 0,
            groups: Vec::new(),
            group_index: HashMap::new(),
            arena: FormIdArena::new(),
            header_extra: Vec::new(),
        }
    }

    /// 内存映射加载（载荷在解析时复制，映射不保留）
    pub fn load(path: &Path, ctx: &PatchContext) -> Result<Plugin, EspError> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EspError::CorruptPluginHeader(format!("invalid path: {}", path.display())))?;

        let mut plugin = Self::from_bytes(&name, &mmap, ctx)?;
        plugin.path = Some(path.to_path_buf());
        Ok(plugin)
    }

    /// 从字节解析完整插件
    pub fn from_bytes(name: &str, data: &[u8], ctx: &PatchContext) -> Result<Plugin, EspError> {
        let mut cursor = RecordCursor::new(data, name);
        if cursor.peek_tag() != Some(*b"TES4") {
            return Err(EspError::CorruptPluginHeader(format!(
                "{}: file does not start with a TES4 header",
                name
            )));
        }

        cursor.extract_tag()?;
        let header_size = cursor.extract_u32()? as usize;
        let flags = cursor.extract_u32()?;
        let _form_id = cursor.extract_u32()?;
        let timestamp = cursor.extract_u16()?;
        let version_control_info = cursor.extract_u16()?;
        let internal_version = cursor.extract_u16()?;
        let header_unknown = cursor.extract_u16()?;
        let header_payload = cursor.extract_bytes(header_size)?;

        let mut version = 0.0f32;
        let mut next_object_id = INITIAL_OBJECT_ID;
        let mut author = None;
        let mut description = None;
        let mut masters: Vec<String> = Vec::new();
        let mut header_extra = Vec::new();
        let mut seen_hedr = false;

        let mut stream = ChunkStream::from_payload(header_payload, "TES4")?;
        while let Some(chunk) = stream.next_chunk() {
            match &chunk.tag {
                b"HEDR" => {
                    let mut hedr = RecordCursor::new(&chunk.data, "TES4");
                    version = hedr.extract_f32()?;
                    let _record_count = hedr.extract_u32()?;
                    next_object_id = hedr.extract_u32()?;
                    seen_hedr = true;
                }
                b"CNAM" => author = Some(RawString::parse_zstring(&chunk.data).content),
                b"SNAM" => description = Some(RawString::parse_zstring(&chunk.data).content),
                b"MAST" => masters.push(RawString::parse_zstring(&chunk.data).content),
                // MAST 的伴随大小字段，重建时写0
                b"DATA" => {}
                _ => header_extra.push(chunk.clone()),
            }
        }
        if !seen_hedr {
            return Err(EspError::CorruptPluginHeader(format!(
                "{}: TES4 header has no HEDR subrecord",
                name
            )));
        }

        let localized = RecordFlags::from_bits_retain(flags).contains(RecordFlags::LOCALIZED);
        let strings = match (&ctx.strings_dir, localized) {
            (Some(dir), true) => {
                let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
                Some(StringTableSet::load_from_directory(dir, stem, &ctx.language)?)
            }
            _ => None,
        };

        let mut arena = FormIdArena::new();
        let mut groups = Vec::new();
        {
            let mut pctx = ParseCtx {
                masters: &masters,
                plugin_name: name,
                arena: &mut arena,
                localized,
                strings: strings.as_ref(),
                record_type: String::new(),
            };
            while !cursor.is_done() {
                groups.push(Group::parse(&mut cursor, &mut pctx)?);
            }
        }

        let mut group_index = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            group_index.entry(group.label).or_insert(i);
        }

        Ok(Plugin {
            path: None,
            name: name.to_string(),
            author,
            description,
            flags,
            masters,
            version,
            next_object_id,
            timestamp,
            version_control_info,
            internal_version,
            header_unknown,
            groups,
            group_index,
            arena,
            header_extra,
        })
    }

    pub fn is_localized(&self) -> bool {
        RecordFlags::from_bits_retain(self.flags).contains(RecordFlags::LOCALIZED)
    }

    pub fn is_master(&self) -> bool {
        RecordFlags::from_bits_retain(self.flags).contains(RecordFlags::MASTER_FILE)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn get_group(&self, label: &[u8; 4]) -> Option<&Group> {
        self.group_index.get(label).map(|&i| &self.groups[i])
    }

    /// 递归统计记录总数
    pub fn count_records(&self) -> usize {
        self.groups.iter().map(|g| g.count_records()).sum()
    }

    /// 分配一个属于本插件的新引用
    pub fn new_form_id(&mut self) -> FormId {
        let key = FormKey::new(&self.name, self.next_object_id);
        self.next_object_id += 1;
        self.arena.intern(key)
    }

    /// 插入记录到其类型的顶层分组，同身份后来者取胜
    pub fn add_record(&mut self, record: Record) -> Option<Record> {
        let idx = match self.group_index.get(&record.record_type) {
            Some(&i) => i,
            None => {
                let i = self.groups.len();
                self.groups.push(Group::new(record.record_type, GROUP_TYPE_TOP));
                self.group_index.insert(record.record_type, i);
                i
            }
        };
        self.groups[idx].upsert(record, &self.arena)
    }

    /// 深拷贝一条外来记录为本插件的自有新记录
    ///
    /// 记录自身与其子分组内的每条记录都从本插件的计数器分配新身份，
    /// 指向这些旧身份的引用一并改写；其余引用原样重新驻留。
    pub fn duplicate_record(
        &mut self,
        record: &Record,
        src_arena: &FormIdArena,
    ) -> Result<Record, EspError> {
        let mut copy = record.copy_for_override(src_arena, &mut self.arena)?;

        let mut old_keys = vec![self.arena.key(copy.form_id).clone()];
        if let Some(group) = &copy.child_group {
            let arena = &self.arena;
            group.for_each_record(&mut |r| old_keys.push(arena.key(r.form_id).clone()));
        }
        let mut remap: HashMap<FormKey, FormKey> = HashMap::new();
        for old in old_keys {
            let fresh = FormKey::new(&self.name, self.next_object_id);
            self.next_object_id += 1;
            remap.insert(old, fresh);
        }

        {
            let arena = &mut self.arena;
            copy.visit_form_ids_mut(&mut |fid| {
                let fresh = remap.get(arena.key(*fid)).cloned();
                if let Some(fresh) = fresh {
                    *fid = arena.intern(fresh);
                }
            });
        }
        if let Some(group) = &mut copy.child_group {
            group.rebuild_index_recursive(&self.arena);
        }
        Ok(copy)
    }

    /// 按引用身份查找（含嵌套分组）
    pub fn find_record(&self, key: &FormKey) -> Option<&Record> {
        self.groups.iter().find_map(|g| g.find_by_form_recursive(key))
    }

    /// 按 EDID 查找（含嵌套分组）
    pub fn find_by_edid(&self, edid: &str) -> Option<&Record> {
        self.groups.iter().find_map(|g| g.find_by_edid_recursive(edid))
    }

    /// 同时取得记录与驻留表的可变借用（合并引擎需要两者）
    pub fn record_and_arena_mut(
        &mut self,
        key: &FormKey,
    ) -> Option<(&mut Record, &mut FormIdArena)> {
        let arena = &mut self.arena;
        for g in &mut self.groups {
            if let Some(r) = g.find_by_form_recursive_mut(key) {
                return Some((r, arena));
            }
        }
        None
    }

    /// 序列化为磁盘字节
    ///
    /// 导出前置步骤按固定顺序执行：分级列表拆分 → 主列表闭包 → 重复检测。
    pub fn export(&mut self, ctx: &PatchContext) -> Result<Vec<u8>, EspError> {
        self.split_oversized_leveled_lists()?;
        self.complete_masters(&ctx.load_order);
        self.check_duplicates()?;

        let ectx = ExportCtx {
            masters: &self.masters,
            plugin_name: &self.name,
            arena: &self.arena,
            localized: self.is_localized(),
            record_type: String::new(),
        };

        let mut out = Vec::new();
        self.export_header(&mut out)?;
        for group in &self.groups {
            if group.is_empty() {
                continue;
            }
            group.export(&mut out, &ectx, ctx.compression)?;
        }
        Ok(out)
    }

    /// 导出并写盘，既有文件先做带时间戳的备份
    pub fn save(&mut self, path: &Path, ctx: &PatchContext) -> Result<(), EspError> {
        let bytes = self.export(ctx)?;
        if path.exists() {
            create_backup(path)?;
        }
        fs::write(path, bytes)?;
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn export_header(&self, out: &mut Vec<u8>) -> Result<(), EspError> {
        let mut payload = Vec::new();

        let mut hedr = Vec::new();
        hedr.extend_from_slice(&self.version.to_le_bytes());
        hedr.extend_from_slice(&(self.count_records() as u32).to_le_bytes());
        hedr.extend_from_slice(&self.next_object_id.to_le_bytes());
        write_chunk(&mut payload, b"HEDR", &hedr)?;

        if let Some(author) = &self.author {
            write_chunk(&mut payload, b"CNAM", &encode_zstring(author))?;
        }
        if let Some(description) = &self.description {
            write_chunk(&mut payload, b"SNAM", &encode_zstring(description))?;
        }
        for master in &self.masters {
            write_chunk(&mut payload, b"MAST", &encode_zstring(master))?;
            write_chunk(&mut payload, b"DATA", &0u64.to_le_bytes())?;
        }
        for chunk in &self.header_extra {
            write_chunk(&mut payload, &chunk.tag, &chunk.data)?;
        }

        out.extend_from_slice(b"TES4");
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // TES4 无身份
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.version_control_info.to_le_bytes());
        out.extend_from_slice(&self.internal_version.to_le_bytes());
        out.extend_from_slice(&self.header_unknown.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// 主列表闭包：收集记录实际引用到的归属插件，缺失者按加载顺序补到主列表末尾
    ///
    /// 加载顺序之外的归属插件按字典序排在最后。既有主列表顺序不变。
    fn complete_masters(&mut self, load_order: &LoadOrder) {
        let mut referenced: HashSet<String> = HashSet::new();
        let arena = &self.arena;
        for g in &self.groups {
            g.visit_form_ids(&mut |fid| {
                if !fid.is_null() {
                    referenced.insert(arena.key(fid).plugin.clone());
                }
            });
        }
        referenced.remove(&self.name.to_ascii_lowercase());

        let mut missing: Vec<String> = referenced
            .into_iter()
            .filter(|p| !self.masters.iter().any(|m| m.eq_ignore_ascii_case(p)))
            .collect();
        missing.sort_by(|a, b| match (load_order.index_of(a), load_order.index_of(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        });

        for m in missing {
            // 用加载顺序里的规范大小写
            let canonical = load_order
                .index_of(&m)
                .map(|i| load_order.entries()[i].name.clone())
                .unwrap_or(m);
            self.masters.push(canonical);
        }
    }

    /// 导出前的重复检测：引用身份全局唯一，EDID 在本插件自有记录中唯一
    fn check_duplicates(&self) -> Result<(), EspError> {
        let mut seen: HashSet<FormKey> = HashSet::new();
        let mut edids: HashMap<String, FormKey> = HashMap::new();
        let self_lower = self.name.to_ascii_lowercase();
        let mut error: Option<EspError> = None;

        for g in &self.groups {
            g.for_each_record(&mut |r| {
                if error.is_some() {
                    return;
                }
                let key = self.arena.key(r.form_id).clone();
                if !seen.insert(key.clone()) {
                    error = Some(EspError::DuplicateIdentifier {
                        plugin: self.name.clone(),
                        reason: format!("duplicate form identifier {}", key),
                    });
                    return;
                }
                if key.plugin != self_lower {
                    return;
                }
                if let Some(edid) = r.editor_id() {
                    if let Some(prev) = edids.insert(edid.to_string(), key.clone()) {
                        if prev != key {
                            error = Some(EspError::DuplicateIdentifier {
                                plugin: self.name.clone(),
                                reason: format!("duplicate editor id '{}'", edid),
                            });
                        }
                    }
                }
            });
        }

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 超容量分级列表拆分为记录链
    ///
    /// 父记录保留前254条原始条目加一条指向延续记录的链接条目（level=1,
    /// count=1），溢出条目移入以新分配身份、EDID 加后缀的延续记录，递归适用。
    fn split_oversized_leveled_lists(&mut self) -> Result<(), EspError> {
        let name = self.name.clone();
        let leveled: Vec<usize> = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| is_leveled_list(&g.label))
            .map(|(i, _)| i)
            .collect();

        for gi in leveled {
            let mut continuations = Vec::new();
            {
                let Plugin {
                    groups,
                    arena,
                    next_object_id,
                    ..
                } = self;
                for record in groups[gi].records_mut() {
                    split_leveled_record(record, &mut continuations, arena, &name, next_object_id, 1)?;
                }
            }
            for c in continuations {
                self.groups[gi].upsert(c, &self.arena);
            }
        }
        Ok(())
    }
}

fn leveled_entries_mut(record: &mut Record) -> Option<&mut CountedListElement> {
    match &mut record.body {
        RecordBody::Parsed(container) => match container.get_mut(b"LLCT") {
            Some(Element::CountedList(list)) => Some(list),
            _ => None,
        },
        RecordBody::Raw(_) => None,
    }
}

fn split_leveled_record(
    record: &mut Record,
    out: &mut Vec<Record>,
    arena: &mut FormIdArena,
    plugin_name: &str,
    next_object_id: &mut u32,
    chain: usize,
) -> Result<(), EspError> {
    let over_capacity = match leveled_entries_mut(record) {
        Some(list) => list.entries.len() > LEVELED_LIST_MAX_ENTRIES,
        None => false,
    };
    if !over_capacity {
        return Ok(());
    }

    let key = FormKey::new(plugin_name, *next_object_id);
    *next_object_id += 1;
    let fid = arena.intern(key);

    let mut continuation = record.clone();
    continuation.child_group = None;
    continuation.form_id = fid;

    let overflow = match leveled_entries_mut(record) {
        Some(list) => {
            let overflow = list.entries.split_off(LEVELED_LIST_MAX_ENTRIES - 1);
            let mut link = Element::from_spec(&list.entry_spec);
            if let Element::Scalar(s) = &mut link {
                s.values = vec![Value::U32(1), Value::FormId(fid), Value::U32(1)];
            }
            list.entries.push(link);
            overflow
        }
        None => return Ok(()),
    };

    if let Some(list) = leveled_entries_mut(&mut continuation) {
        list.entries = overflow;
    }
    if let Some(edid) = record.editor_id().map(|s| s.to_string()) {
        continuation.set_editor_id(format!("{}_Cont{}", edid, chain));
    }

    split_leveled_record(&mut continuation, out, arena, plugin_name, next_object_id, chain + 1)?;
    out.push(continuation);
    Ok(())
}
