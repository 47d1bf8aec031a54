use crate::element::{ElementSpec, SubrecordContainer};
use std::collections::HashMap;
use std::sync::Arc;

/// 原型槽位：一个命名的字段布局项
///
/// 绑定一种子记录变体的构造描述和一个或多个可接受的类型标签。
#[derive(Debug, Clone)]
pub struct Slot {
    /// 槽位名（访问器与合并报告使用）
    pub name: String,
    /// 可接受的4字符标签集合
    pub tags: Vec<[u8; 4]>,
    /// 即使语义为空也强制导出
    pub force_export: bool,
    /// 变体构造描述
    pub spec: Arc<ElementSpec>,
}

impl Slot {
    pub fn new(name: impl Into<String>, tags: Vec<[u8; 4]>, spec: ElementSpec) -> Self {
        Slot {
            name: name.into(),
            tags,
            force_export: false,
            spec: Arc::new(spec),
        }
    }
}

/// 记录原型：有序、可变的字段布局描述
///
/// 解析时按标签分发到槽位（声明顺序靠前的槽位优先注册标签，
/// 保证 BulkType/MarkerSet 的歧义消解遵循声明顺序）；
/// 导出时按声明顺序迭代槽位。`slot_for` 为 O(1)，所有访问器经由它。
#[derive(Debug, Clone, Default)]
pub struct Prototype {
    slots: Vec<Slot>,
    index: HashMap<[u8; 4], usize>,
}

impl Prototype {
    pub fn new() -> Self {
        Prototype {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// 以父原型的槽位列表为起点派生（组合复制，非继承）
    pub fn derive_from(parent: &Prototype) -> Self {
        parent.clone()
    }

    /// 末尾追加槽位
    pub fn append(&mut self, slot: Slot) -> &mut Self {
        self.slots.push(slot);
        self.rebuild_index();
        self
    }

    /// 按标签移除槽位，返回是否找到
    pub fn remove(&mut self, tag: &[u8; 4]) -> bool {
        match self.position_of(tag) {
            Some(pos) => {
                self.slots.remove(pos);
                self.rebuild_index();
                true
            }
            None => false,
        }
    }

    /// 在锚标签所在槽位之前插入新槽位，找不到锚时不插入
    pub fn insert_before(&mut self, anchor: &[u8; 4], slot: Slot) -> bool {
        match self.position_of(anchor) {
            Some(pos) => {
                self.slots.insert(pos, slot);
                self.rebuild_index();
                true
            }
            None => false,
        }
    }

    /// 在锚标签所在槽位之后插入新槽位，找不到锚时不插入
    pub fn insert_after(&mut self, anchor: &[u8; 4], slot: Slot) -> bool {
        match self.position_of(anchor) {
            Some(pos) => {
                self.slots.insert(pos + 1, slot);
                self.rebuild_index();
                true
            }
            None => false,
        }
    }

    /// 标记强制导出
    pub fn force_export(&mut self, tag: &[u8; 4]) -> bool {
        match self.position_of(tag) {
            Some(pos) => {
                self.slots[pos].force_export = true;
                true
            }
            None => false,
        }
    }

    fn position_of(&self, tag: &[u8; 4]) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.tags.iter().any(|t| t == tag))
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, slot) in self.slots.iter().enumerate() {
            for tag in &slot.tags {
                // 声明顺序靠前的槽位优先
                self.index.entry(*tag).or_insert(i);
            }
        }
    }

    /// O(1) 标签 → 槽位下标
    pub fn slot_for(&self, tag: &[u8; 4]) -> Option<usize> {
        self.index.get(tag).copied()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 全部可接受标签（外层Shell槽位的标签集合由此计算）
    pub fn all_tags(&self) -> Vec<[u8; 4]> {
        let mut tags = Vec::new();
        for slot in &self.slots {
            for tag in &slot.tags {
                if !tags.contains(tag) {
                    tags.push(*tag);
                }
            }
        }
        tags
    }

    /// 实例化一个空的子记录容器
    pub fn instantiate(self: &Arc<Prototype>) -> SubrecordContainer {
        SubrecordContainer::new(Arc::clone(self))
    }
}
