use crate::cursor::RecordCursor;
use crate::datatypes::RawString;
use crate::utils::EspError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// 外部字符串表的三种文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringTableKind {
    /// .STRINGS：null终止存储
    Strings,
    /// .DLSTRINGS：u32长度前缀存储
    DlStrings,
    /// .ILSTRINGS：u32长度前缀存储
    IlStrings,
}

impl StringTableKind {
    pub const ALL: [StringTableKind; 3] = [
        StringTableKind::Strings,
        StringTableKind::DlStrings,
        StringTableKind::IlStrings,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            StringTableKind::Strings => "STRINGS",
            StringTableKind::DlStrings => "DLSTRINGS",
            StringTableKind::IlStrings => "ILSTRINGS",
        }
    }

    /// 长度前缀存储（否则null终止）
    pub fn has_length_prefix(&self) -> bool {
        !matches!(self, StringTableKind::Strings)
    }
}

/// 单个字符串表：string-id → 文本
///
/// 布局：u32条目数 + u32数据区大小 + 目录[(u32 id, u32 offset)] + 数据区。
/// 偏移相对数据区起点。
#[derive(Debug, Clone)]
pub struct StringTable {
    pub kind: StringTableKind,
    entries: HashMap<u32, String>,
}

impl StringTable {
    pub fn parse_bytes(kind: StringTableKind, data: &[u8]) -> Result<Self, EspError> {
        let label = format!("string table ({})", kind.extension());
        let mut cursor = RecordCursor::new(data, label.clone());

        let count = cursor.extract_u32()? as usize;
        let data_size = cursor.extract_u32()? as usize;

        let mut directory = Vec::with_capacity(count);
        for _ in 0..count {
            let id = cursor.extract_u32()?;
            let offset = cursor.extract_u32()? as usize;
            directory.push((id, offset));
        }

        let blob = cursor.extract_rest();
        if blob.len() != data_size {
            return Err(EspError::malformed(
                label,
                format!(
                    "data region size mismatch: header says {}, actual {}",
                    data_size,
                    blob.len()
                ),
            ));
        }

        let mut entries = HashMap::with_capacity(count);
        for (id, offset) in directory {
            if offset > blob.len() {
                return Err(EspError::malformed(
                    format!("string table ({})", kind.extension()),
                    format!("directory offset {} beyond data region", offset),
                ));
            }
            let text = if kind.has_length_prefix() {
                let mut entry_cursor =
                    RecordCursor::new(&blob[offset..], format!("string {:08X}", id));
                // 前缀长度包含null终止符
                let len = entry_cursor.extract_u32()? as usize;
                let raw = entry_cursor.extract_bytes(len)?;
                RawString::parse_zstring(raw).content
            } else {
                let mut entry_cursor =
                    RecordCursor::new(&blob[offset..], format!("string {:08X}", id));
                entry_cursor.extract_zstring().content
            };
            entries.insert(id, text);
        }

        Ok(StringTable { kind, entries })
    }

    /// 重建表文件字节（条目按id排序，偏移重算）
    pub fn rebuild(&self) -> Vec<u8> {
        let mut ids: Vec<&u32> = self.entries.keys().collect();
        ids.sort();

        let mut blob: Vec<u8> = Vec::new();
        let mut directory: Vec<(u32, u32)> = Vec::with_capacity(ids.len());
        for &id in &ids {
            directory.push((*id, blob.len() as u32));
            let text = &self.entries[id];
            if self.kind.has_length_prefix() {
                blob.extend_from_slice(&((text.len() + 1) as u32).to_le_bytes());
            }
            blob.extend_from_slice(text.as_bytes());
            blob.push(0);
        }

        let mut out = Vec::with_capacity(8 + directory.len() * 8 + blob.len());
        out.extend_from_slice(&(directory.len() as u32).to_le_bytes());
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        for (id, offset) in directory {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&blob);
        out
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|s| s.as_str())
    }

    pub fn insert(&mut self, id: u32, text: String) {
        self.entries.insert(id, text);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一个插件的全部字符串表（三种类型各至多一张）
#[derive(Debug, Clone, Default)]
pub struct StringTableSet {
    tables: Vec<StringTable>,
}

impl StringTableSet {
    pub fn new(tables: Vec<StringTable>) -> Self {
        StringTableSet { tables }
    }

    /// 按约定文件名从目录加载：`<插件名去扩展>_<语言>.<表扩展名>`
    ///
    /// 缺失的表文件按空表跳过（本地化插件不一定三种表齐全）。
    pub fn load_from_directory(
        dir: &Path,
        plugin_stem: &str,
        language: &str,
    ) -> Result<Self, EspError> {
        let mut tables = Vec::new();
        for kind in StringTableKind::ALL {
            let file_name = format!("{}_{}.{}", plugin_stem, language, kind.extension());
            let path = dir.join(&file_name);
            if !path.exists() {
                continue;
            }
            let data = fs::read(&path)?;
            tables.push(StringTable::parse_bytes(kind, &data)?);
        }
        Ok(StringTableSet { tables })
    }

    /// 按id查找，依次搜索所有已加载的表
    pub fn get(&self, id: u32) -> Option<&str> {
        self.tables.iter().find_map(|t| t.get(id))
    }

    pub fn tables(&self) -> &[StringTable] {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_table(kind: StringTableKind, items: &[(u32, &str)]) -> StringTable {
        let mut table = StringTable {
            kind,
            entries: HashMap::new(),
        };
        for (id, text) in items {
            table.insert(*id, text.to_string());
        }
        table
    }

    #[test]
    fn test_strings_table_roundtrip() {
        let table = build_table(
            StringTableKind::Strings,
            &[(0x1234, "Iron Sword"), (0x5678, "Steel Dagger")],
        );
        let bytes = table.rebuild();
        let parsed = StringTable::parse_bytes(StringTableKind::Strings, &bytes).unwrap();

        assert_eq!(parsed.get(0x1234), Some("Iron Sword"));
        assert_eq!(parsed.get(0x5678), Some("Steel Dagger"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_length_prefixed_table_roundtrip() {
        let table = build_table(StringTableKind::DlStrings, &[(7, "A longer description.")]);
        let bytes = table.rebuild();
        let parsed = StringTable::parse_bytes(StringTableKind::DlStrings, &bytes).unwrap();

        assert_eq!(parsed.get(7), Some("A longer description."));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let table = build_table(StringTableKind::Strings, &[(1, "x")]);
        let mut bytes = table.rebuild();
        bytes.push(0xFF); // 数据区比头部声明多一字节

        let result = StringTable::parse_bytes(StringTableKind::Strings, &bytes);
        assert!(result.is_err(), "数据区大小不符应该报错");
    }

    #[test]
    fn test_set_searches_all_kinds() {
        let set = StringTableSet::new(vec![
            build_table(StringTableKind::Strings, &[(1, "name")]),
            build_table(StringTableKind::DlStrings, &[(2, "description")]),
        ]);

        assert_eq!(set.get(1), Some("name"));
        assert_eq!(set.get(2), Some("description"));
        assert_eq!(set.get(3), None);
    }
}
