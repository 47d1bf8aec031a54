use crate::context::CompressionPolicy;
use crate::cursor::RecordCursor;
use crate::datatypes::{tag_to_string, RecordFlags};
use crate::element::{ChunkStream, ExportCtx, ParseCtx, SubrecordContainer, Value};
use crate::formid::{FormId, FormIdArena};
use crate::group::Group;
use crate::records::prototype_for;
use crate::utils::EspError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// 记录头固定长度
pub const RECORD_HEADER_SIZE: usize = 24;

/// 解压记录载荷：u32明文长度 + zlib流
pub fn decompress_payload(data: &[u8], record_type: &str) -> Result<Vec<u8>, EspError> {
    let mut cursor = RecordCursor::new(data, record_type);
    let expected = cursor.extract_u32()? as usize;

    let mut decoder = ZlibDecoder::new(cursor.extract_rest());
    let mut out = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EspError::Compression(format!("{}: {}", record_type, e)))?;

    if out.len() != expected {
        return Err(EspError::Compression(format!(
            "{}: decompressed size mismatch, header says {}, actual {}",
            record_type,
            expected,
            out.len()
        )));
    }
    Ok(out)
}

/// 压缩记录载荷为磁盘格式
pub fn compress_payload(data: &[u8]) -> Result<Vec<u8>, EspError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| EspError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| EspError::Compression(e.to_string()))?;

    let mut out = Vec::with_capacity(4 + compressed.len());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// 记录体：已注册类型解析为容器，未注册类型原样保留
///
/// Raw 保存磁盘上的原始载荷（压缩记录含压缩字节），导出时逐字节写回，
/// 保证未建模类型位级往返。
#[derive(Debug, Clone)]
pub enum RecordBody {
    Parsed(SubrecordContainer),
    Raw(Vec<u8>),
}

/// 顶层记录
#[derive(Debug, Clone)]
pub struct Record {
    pub record_type: [u8; 4],
    pub flags: u32,
    pub form_id: FormId,
    pub timestamp: u16,
    pub version_control_info: u16,
    pub internal_version: u16,
    pub unknown: u16,
    pub body: RecordBody,
    /// 紧随其后的子分组（如 DIAL 的话题子分组）
    pub child_group: Option<Box<Group>>,
}

impl Record {
    /// API 构造路径：新建空记录
    pub fn new(record_type: [u8; 4], form_id: FormId, container: SubrecordContainer) -> Self {
        Record {
            record_type,
            flags: 0,
            form_id,
            timestamp: 0,
            version_control_info: 0,
            internal_version: 44,
            unknown: 0,
            body: RecordBody::Parsed(container),
            child_group: None,
        }
    }

    /// 从游标解析一条完整记录（游标位于记录头起点）
    pub fn parse(cursor: &mut RecordCursor<'_>, ctx: &mut ParseCtx<'_>) -> Result<Record, EspError> {
        let record_type = cursor.extract_tag()?;
        let type_name = tag_to_string(&record_type);
        let data_size = cursor.extract_u32()? as usize;
        let flags = cursor.extract_u32()?;
        let raw_form_id = cursor.extract_u32()?;
        let timestamp = cursor.extract_u16()?;
        let version_control_info = cursor.extract_u16()?;
        let internal_version = cursor.extract_u16()?;
        let unknown = cursor.extract_u16()?;
        let payload = cursor.extract_bytes(data_size)?;

        let form_id = ctx.arena.resolve(raw_form_id, ctx.masters, ctx.plugin_name);
        ctx.record_type = type_name.clone();

        let compressed = RecordFlags::from_bits_retain(flags).contains(RecordFlags::COMPRESSED);

        let body = match prototype_for(&record_type) {
            Some(proto) => {
                let plain;
                let chunk_source: &[u8] = if compressed {
                    plain = decompress_payload(payload, &type_name)?;
                    &plain
                } else {
                    payload
                };
                match Self::parse_body(&proto, chunk_source, &type_name, ctx)? {
                    Some(container) => RecordBody::Parsed(container),
                    // 原型未覆盖全部子记录：整体回退为原样保留
                    None => RecordBody::Raw(payload.to_vec()),
                }
            }
            None => RecordBody::Raw(payload.to_vec()),
        };

        Ok(Record {
            record_type,
            flags,
            form_id,
            timestamp,
            version_control_info,
            internal_version,
            unknown,
            body,
            child_group: None,
        })
    }

    fn parse_body(
        proto: &std::sync::Arc<crate::prototype::Prototype>,
        payload: &[u8],
        type_name: &str,
        ctx: &mut ParseCtx<'_>,
    ) -> Result<Option<SubrecordContainer>, EspError> {
        let mut stream = ChunkStream::from_payload(payload, type_name)?;
        let mut container = proto.instantiate();
        container.consume(&mut stream, ctx)?;
        if !stream.is_done() {
            return Ok(None);
        }
        Ok(Some(container))
    }

    /// 按导出上下文序列化（头部 + 载荷；子分组由分组层写出）
    pub fn export(
        &self,
        out: &mut Vec<u8>,
        ctx: &ExportCtx<'_>,
        policy: CompressionPolicy,
    ) -> Result<(), EspError> {
        let mut flags = self.flags;
        let payload = match &self.body {
            RecordBody::Raw(bytes) => bytes.clone(),
            RecordBody::Parsed(container) => {
                let record_ctx = ExportCtx {
                    masters: ctx.masters,
                    plugin_name: ctx.plugin_name,
                    arena: ctx.arena,
                    localized: ctx.localized,
                    record_type: tag_to_string(&self.record_type),
                };
                let mut plain = Vec::new();
                container.export(&mut plain, &record_ctx)?;

                let was_compressed =
                    RecordFlags::from_bits_retain(flags).contains(RecordFlags::COMPRESSED);
                match (was_compressed, policy) {
                    (true, CompressionPolicy::Preserve) => compress_payload(&plain)?,
                    (true, CompressionPolicy::Never) => {
                        flags &= !RecordFlags::COMPRESSED.bits();
                        plain
                    }
                    (false, _) => plain,
                }
            }
        };

        let raw_form_id = ctx.arena.unresolve(self.form_id, ctx.masters, ctx.plugin_name)?;

        out.extend_from_slice(&self.record_type);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&raw_form_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.version_control_info.to_le_bytes());
        out.extend_from_slice(&self.internal_version.to_le_bytes());
        out.extend_from_slice(&self.unknown.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// EDID 编辑器标识（未解析或无 EDID 时为 None）
    pub fn editor_id(&self) -> Option<&str> {
        match &self.body {
            RecordBody::Parsed(container) => match container.scalar_values(b"EDID") {
                Some([Value::String(s), ..]) => Some(s.as_str()),
                _ => None,
            },
            RecordBody::Raw(_) => None,
        }
    }

    /// 设置 EDID（容器没有 EDID 槽位时返回 false）
    pub fn set_editor_id(&mut self, edid: impl Into<String>) -> bool {
        match &mut self.body {
            RecordBody::Parsed(container) => {
                container.set_scalar(b"EDID", vec![Value::String(edid.into())])
            }
            RecordBody::Raw(_) => false,
        }
    }

    pub fn record_flags(&self) -> RecordFlags {
        RecordFlags::from_bits_retain(self.flags)
    }

    pub fn is_deleted(&self) -> bool {
        self.record_flags().contains(RecordFlags::DELETED)
    }

    /// 遍历记录自身与子分组包含的全部引用（含头部标识）
    pub fn visit_form_ids(&self, f: &mut dyn FnMut(FormId)) {
        f(self.form_id);
        if let RecordBody::Parsed(container) = &self.body {
            container.visit_form_ids(f);
        }
        if let Some(group) = &self.child_group {
            group.visit_form_ids(f);
        }
    }

    pub fn visit_form_ids_mut(&mut self, f: &mut dyn FnMut(&mut FormId)) {
        f(&mut self.form_id);
        if let RecordBody::Parsed(container) = &mut self.body {
            container.visit_form_ids_mut(f);
        }
        if let Some(group) = &mut self.child_group {
            group.visit_form_ids_mut(f);
        }
    }

    /// 跨插件覆盖复制：全部句柄在目标驻留表重新驻留，身份保持不变
    ///
    /// 原样保留的记录体内嵌引用无法改写，不支持复制。
    pub fn copy_for_override(
        &self,
        src_arena: &FormIdArena,
        dest_arena: &mut FormIdArena,
    ) -> Result<Record, EspError> {
        if matches!(self.body, RecordBody::Raw(_)) {
            return Err(EspError::malformed(
                tag_to_string(&self.record_type),
                "cannot copy an unparsed record across plugins",
            ));
        }
        let mut copy = self.clone();
        copy.visit_form_ids_mut(&mut |fid| {
            let key = src_arena.key(*fid).clone();
            *fid = dest_arena.intern(key);
        });
        Ok(copy)
    }
}
