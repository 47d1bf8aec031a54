use crate::formid::ModListing;
use std::path::PathBuf;

/// 压缩记录的导出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    /// 读入时压缩的记录导出时重新压缩（默认）
    #[default]
    Preserve,
    /// 一律明文导出并清除压缩标志
    Never,
}

/// 全局加载顺序
///
/// 文本格式兼容 plugins.txt：每行一个插件文件名，
/// 行首 `*` 表示激活（记录但不改变次序语义），`#` 开头为注释。
#[derive(Debug, Clone, Default)]
pub struct LoadOrder {
    entries: Vec<ModListing>,
}

impl LoadOrder {
    pub fn new(entries: Vec<ModListing>) -> Self {
        LoadOrder { entries }
    }

    /// 从文件名列表构建
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        LoadOrder {
            entries: names.iter().map(|n| ModListing::new(n.as_ref())).collect(),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let name = line.strip_prefix('*').unwrap_or(line).trim();
            if !name.is_empty() {
                entries.push(ModListing::new(name));
            }
        }
        LoadOrder { entries }
    }

    /// 加载顺序中的位置（忽略大小写）
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn entries(&self) -> &[ModListing] {
        &self.entries
    }

    pub fn push(&mut self, listing: ModListing) {
        self.entries.push(listing);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一次补丁构建的全部环境配置（显式传递，不落在进程全局）
#[derive(Debug, Clone)]
pub struct PatchContext {
    pub load_order: LoadOrder,
    /// 本地化字符串表的语言后缀
    pub language: String,
    pub compression: CompressionPolicy,
    /// 主列表闭包算法：false=仅实际引用到的插件，true=穷举全部已导入插件
    pub exhaustive_masters: bool,
    /// 字符串表所在目录（None 时不查表，LString 仅保留id）
    pub strings_dir: Option<PathBuf>,
}

impl Default for PatchContext {
    fn default() -> Self {
        PatchContext {
            load_order: LoadOrder::default(),
            language: "English".to_string(),
            compression: CompressionPolicy::Preserve,
            exhaustive_masters: false,
            strings_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plugins_txt() {
        let text = "# 注释行\n*Skyrim.esm\nUpdate.esm\n\n*MyMod.esp\n";
        let order = LoadOrder::parse(text);

        assert_eq!(order.len(), 3);
        assert_eq!(order.entries()[0].name, "Skyrim.esm");
        assert!(order.entries()[0].is_master);
        assert_eq!(order.entries()[2].name, "MyMod.esp");
        assert!(!order.entries()[2].is_master);
    }

    #[test]
    fn test_index_ignores_case() {
        let order = LoadOrder::from_names(&["Skyrim.esm", "MyMod.esp"]);
        assert_eq!(order.index_of("skyrim.ESM"), Some(0));
        assert_eq!(order.index_of("mymod.esp"), Some(1));
        assert_eq!(order.index_of("other.esp"), None);
    }
}
