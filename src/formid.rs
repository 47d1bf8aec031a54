use crate::utils::EspError;
use serde::Serialize;
use std::collections::HashMap;

/// 一个插件文件的身份 = (文件名, 主文件标志)
///
/// 加载顺序上下文（`context::LoadOrder`）给出全序。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModListing {
    pub name: String,
    pub is_master: bool,
}

impl ModListing {
    /// 从文件名创建，主文件标志按扩展名推断
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let is_master = name
            .rsplit('.')
            .next()
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                ext == "esm" || ext == "esl"
            })
            .unwrap_or(false);
        ModListing { name, is_master }
    }
}

impl std::fmt::Display for ModListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// 已解析的引用身份 = (归属插件, 24位局部索引)
///
/// "self" 在解析时就替换为来源插件的具体文件名，插件名统一小写存储，
/// 因此跨插件比较就是结构相等比较。零引用用空插件名 + 局部索引0表示。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FormKey {
    pub plugin: String,
    pub local: u32,
}

impl FormKey {
    pub fn new(plugin: impl AsRef<str>, local: u32) -> Self {
        FormKey {
            plugin: plugin.as_ref().to_ascii_lowercase(),
            local: local & 0x00FF_FFFF,
        }
    }

    /// 规范空引用
    pub fn null() -> Self {
        FormKey {
            plugin: String::new(),
            local: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.plugin.is_empty() && self.local == 0
    }
}

impl std::fmt::Display for FormKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "{:06X}|{}", self.local, self.plugin)
        }
    }
}

/// 引用句柄：指向所属插件 FormIdArena 中的一个槽位
///
/// 同一逻辑引用在所有使用处共享同一槽位，改写槽位（`FormIdArena::rewrite`）
/// 对所有持有者可见，这是批量引用改写（复制/合并）的基础。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormId(u32);

impl FormId {
    /// 规范空引用句柄，永不解析到任何记录
    pub const NULL: FormId = FormId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

/// 引用驻留表
///
/// 每个 Plugin 持有一张。相同 FormKey 驻留到同一槽位，
/// 句柄是 Copy 的槽位下标而不是别名可变对象。
#[derive(Debug, Clone)]
pub struct FormIdArena {
    cells: Vec<FormKey>,
    index: HashMap<FormKey, u32>,
}

impl Default for FormIdArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FormIdArena {
    pub fn new() -> Self {
        let null = FormKey::null();
        let mut index = HashMap::new();
        index.insert(null.clone(), 0);
        FormIdArena {
            cells: vec![null],
            index,
        }
    }

    /// 驻留一个引用身份，返回共享句柄
    pub fn intern(&mut self, key: FormKey) -> FormId {
        if key.is_null() {
            return FormId::NULL;
        }
        if let Some(&slot) = self.index.get(&key) {
            return FormId(slot);
        }
        let slot = self.cells.len() as u32;
        self.cells.push(key.clone());
        self.index.insert(key, slot);
        FormId(slot)
    }

    /// 读取句柄对应的身份
    pub fn key(&self, fid: FormId) -> &FormKey {
        &self.cells[fid.index()]
    }

    /// 改写一个槽位：所有持有该句柄的引用处同时生效
    pub fn rewrite(&mut self, fid: FormId, new_key: FormKey) {
        if fid.is_null() {
            return; // 空引用不可改写
        }
        let old = self.cells[fid.index()].clone();
        if self.index.get(&old) == Some(&(fid.index() as u32)) {
            self.index.remove(&old);
        }
        self.index.entry(new_key.clone()).or_insert(fid.index() as u32);
        self.cells[fid.index()] = new_key;
    }

    /// 解析32位打包引用
    ///
    /// 最高字节索引来源插件的主文件列表，超出列表长度表示来源插件自身；
    /// 低24位是局部索引。解析阶段只做结构转换，不校验目标是否可导入。
    pub fn resolve(&mut self, raw: u32, masters: &[String], source_name: &str) -> FormId {
        if raw == 0 {
            return FormId::NULL;
        }
        let master_index = (raw >> 24) as usize;
        let local = raw & 0x00FF_FFFF;
        let owner = if master_index < masters.len() {
            masters[master_index].as_str()
        } else {
            source_name
        };
        self.intern(FormKey::new(owner, local))
    }

    /// 逆向打包：要求归属插件出现在目标插件的主文件列表中
    ///
    /// 归属插件既不是目标自身也不在其主列表中时报 MissingMasterDependency
    /// （导出流程会先补全主列表，这里只剩真正无法解析的引用）。
    pub fn unresolve(
        &self,
        fid: FormId,
        masters: &[String],
        dest_name: &str,
    ) -> Result<u32, EspError> {
        if fid.is_null() {
            return Ok(0);
        }
        let key = self.key(fid);
        let dest_lower = dest_name.to_ascii_lowercase();

        let master_index = if key.plugin == dest_lower {
            masters.len()
        } else {
            masters
                .iter()
                .position(|m| m.to_ascii_lowercase() == key.plugin)
                .ok_or_else(|| EspError::MissingMasterDependency {
                    plugin: dest_name.to_string(),
                    master: key.plugin.clone(),
                })?
        };

        Ok(((master_index as u32) << 24) | key.local)
    }

    /// 遍历全部非空槽位（用于主文件闭包计算）
    pub fn keys(&self) -> impl Iterator<Item = &FormKey> {
        self.cells.iter().filter(|k| !k.is_null())
    }
}
