use crate::context::CompressionPolicy;
use crate::cursor::RecordCursor;
use crate::datatypes::tag_to_string;
use crate::element::{ExportCtx, ParseCtx};
use crate::formid::{FormId, FormIdArena, FormKey};
use crate::record::Record;
use crate::utils::EspError;
use std::collections::HashMap;

/// 分组头固定长度
pub const GROUP_HEADER_SIZE: usize = 24;

/// 顶层分组的类型码
pub const GROUP_TYPE_TOP: i32 = 0;
/// 话题子分组的类型码（DIAL 记录之后的 INFO 容器）
pub const GROUP_TYPE_TOPIC_CHILDREN: i32 = 7;

/// 记录分组（GRUP 容器）
///
/// 持有记录序列和两套查找索引：按引用身份（FormKey）和按 EDID。
/// 嵌套分组有两种挂接方式：紧随某条记录的分组挂为该记录的子分组，
/// 无前导记录的分组作为前导子分组保留在本分组内，导出时写在记录之前。
#[derive(Debug, Clone)]
pub struct Group {
    /// 标签：顶层分组为记录类型标签，其余类型是块号或父记录引用
    pub label: [u8; 4],
    pub group_type: i32,
    pub timestamp: u16,
    pub version_control_info: u16,
    pub unknown: u32,
    records: Vec<Record>,
    leading_groups: Vec<Group>,
    by_form: HashMap<FormKey, usize>,
    by_edid: HashMap<String, usize>,
}

impl Group {
    pub fn new(label: [u8; 4], group_type: i32) -> Self {
        Group {
            label,
            group_type,
            timestamp: 0,
            version_control_info: 0,
            unknown: 0,
            records: Vec::new(),
            leading_groups: Vec::new(),
            by_form: HashMap::new(),
            by_edid: HashMap::new(),
        }
    }

    /// 从游标解析一个完整分组（游标位于 GRUP 头起点）
    pub fn parse(cursor: &mut RecordCursor<'_>, ctx: &mut ParseCtx<'_>) -> Result<Group, EspError> {
        let magic = cursor.extract_tag()?;
        if &magic != b"GRUP" {
            return Err(EspError::malformed(
                "GRUP",
                format!("expected GRUP header, found {}", tag_to_string(&magic)),
            ));
        }
        let total_size = cursor.extract_u32()? as usize;
        if total_size < GROUP_HEADER_SIZE {
            return Err(EspError::malformed(
                "GRUP",
                format!("group size {} smaller than its header", total_size),
            ));
        }
        let label = cursor.extract_tag()?;
        let group_type = cursor.extract_i32()?;
        let timestamp = cursor.extract_u16()?;
        let version_control_info = cursor.extract_u16()?;
        let unknown = cursor.extract_u32()?;

        // 声明大小包含分组头自身
        let content = cursor.extract_bytes(total_size - GROUP_HEADER_SIZE)?;
        let mut inner = RecordCursor::new(content, format!("GRUP {}", tag_to_string(&label)));

        let mut group = Group::new(label, group_type);
        group.timestamp = timestamp;
        group.version_control_info = version_control_info;
        group.unknown = unknown;

        while !inner.is_done() {
            match inner.peek_tag() {
                Some(tag) if &tag == b"GRUP" => {
                    let nested = Group::parse(&mut inner, ctx)?;
                    match group.records.last_mut() {
                        // 紧随记录的嵌套分组挂为其子分组
                        Some(record) => match record.child_group.as_mut() {
                            Some(child) => child.leading_groups.push(nested),
                            None => record.child_group = Some(Box::new(nested)),
                        },
                        None => group.leading_groups.push(nested),
                    }
                }
                Some(_) => {
                    let record = Record::parse(&mut inner, ctx)?;
                    group.upsert(record, ctx.arena);
                }
                None => {
                    return Err(EspError::malformed(
                        "GRUP",
                        "truncated content region".to_string(),
                    ))
                }
            }
        }

        Ok(group)
    }

    /// 插入或替换：同身份的后来者取胜，返回被替换的记录
    pub fn upsert(&mut self, record: Record, arena: &FormIdArena) -> Option<Record> {
        let key = arena.key(record.form_id).clone();
        let edid = record.editor_id().map(|s| s.to_string());

        match self.by_form.get(&key) {
            Some(&idx) => {
                if let Some(edid) = edid {
                    self.by_edid.insert(edid, idx);
                }
                Some(std::mem::replace(&mut self.records[idx], record))
            }
            None => {
                let idx = self.records.len();
                self.by_form.insert(key, idx);
                if let Some(edid) = edid {
                    self.by_edid.insert(edid, idx);
                }
                self.records.push(record);
                None
            }
        }
    }

    pub fn get_by_form(&self, key: &FormKey) -> Option<&Record> {
        self.by_form.get(key).map(|&idx| &self.records[idx])
    }

    pub fn get_mut_by_form(&mut self, key: &FormKey) -> Option<&mut Record> {
        match self.by_form.get(key) {
            Some(&idx) => Some(&mut self.records[idx]),
            None => None,
        }
    }

    pub fn get_by_edid(&self, edid: &str) -> Option<&Record> {
        self.by_edid.get(edid).map(|&idx| &self.records[idx])
    }

    pub fn contains_form(&self, key: &FormKey) -> bool {
        self.by_form.contains_key(key)
    }

    /// 递归查找（含前导子分组与记录的子分组）
    pub fn find_by_form_recursive(&self, key: &FormKey) -> Option<&Record> {
        if let Some(r) = self.get_by_form(key) {
            return Some(r);
        }
        for g in &self.leading_groups {
            if let Some(r) = g.find_by_form_recursive(key) {
                return Some(r);
            }
        }
        for r in &self.records {
            if let Some(child) = &r.child_group {
                if let Some(found) = child.find_by_form_recursive(key) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn find_by_form_recursive_mut(&mut self, key: &FormKey) -> Option<&mut Record> {
        if let Some(&idx) = self.by_form.get(key) {
            return Some(&mut self.records[idx]);
        }
        for g in &mut self.leading_groups {
            if let Some(r) = g.find_by_form_recursive_mut(key) {
                return Some(r);
            }
        }
        for r in &mut self.records {
            if let Some(child) = &mut r.child_group {
                if let Some(found) = child.find_by_form_recursive_mut(key) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn find_by_edid_recursive(&self, edid: &str) -> Option<&Record> {
        if let Some(r) = self.get_by_edid(edid) {
            return Some(r);
        }
        for g in &self.leading_groups {
            if let Some(r) = g.find_by_edid_recursive(edid) {
                return Some(r);
            }
        }
        for r in &self.records {
            if let Some(child) = &r.child_group {
                if let Some(found) = child.find_by_edid_recursive(edid) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// 深度优先遍历全部记录（含嵌套）
    pub fn for_each_record(&self, f: &mut dyn FnMut(&Record)) {
        for g in &self.leading_groups {
            g.for_each_record(f);
        }
        for r in &self.records {
            f(r);
            if let Some(child) = &r.child_group {
                child.for_each_record(f);
            }
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn leading_groups(&self) -> &[Group] {
        &self.leading_groups
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.leading_groups.is_empty()
    }

    /// 递归统计包含的记录数（含子分组）
    pub fn count_records(&self) -> usize {
        let mut count = self.records.len();
        for g in &self.leading_groups {
            count += g.count_records();
        }
        for r in &self.records {
            if let Some(g) = &r.child_group {
                count += g.count_records();
            }
        }
        count
    }

    /// 序列化分组：先写头部占位，内容写完后回填总大小
    pub fn export(
        &self,
        out: &mut Vec<u8>,
        ctx: &ExportCtx<'_>,
        policy: CompressionPolicy,
    ) -> Result<(), EspError> {
        self.export_with_label(out, ctx, policy, self.label)
    }

    fn export_with_label(
        &self,
        out: &mut Vec<u8>,
        ctx: &ExportCtx<'_>,
        policy: CompressionPolicy,
        label: [u8; 4],
    ) -> Result<(), EspError> {
        let header_start = out.len();
        out.extend_from_slice(b"GRUP");
        out.extend_from_slice(&0u32.to_le_bytes()); // 大小占位
        out.extend_from_slice(&label);
        out.extend_from_slice(&self.group_type.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.version_control_info.to_le_bytes());
        out.extend_from_slice(&self.unknown.to_le_bytes());

        for nested in &self.leading_groups {
            nested.export(out, ctx, policy)?;
        }
        for record in &self.records {
            record.export(out, ctx, policy)?;
            if let Some(child) = &record.child_group {
                // 话题子分组的标签是父记录的原始 FormID，跟随当前
                // 主列表重新编码，不能写回解析时的字节
                let child_label = if child.group_type == GROUP_TYPE_TOPIC_CHILDREN {
                    ctx.arena
                        .unresolve(record.form_id, ctx.masters, ctx.plugin_name)?
                        .to_le_bytes()
                } else {
                    child.label
                };
                child.export_with_label(out, ctx, policy, child_label)?;
            }
        }

        // 回填：声明大小包含分组头
        let total = (out.len() - header_start) as u32;
        out[header_start + 4..header_start + 8].copy_from_slice(&total.to_le_bytes());
        Ok(())
    }

    pub fn visit_form_ids(&self, f: &mut dyn FnMut(FormId)) {
        for g in &self.leading_groups {
            g.visit_form_ids(f);
        }
        for r in &self.records {
            r.visit_form_ids(f);
        }
    }

    pub fn visit_form_ids_mut(&mut self, f: &mut dyn FnMut(&mut FormId)) {
        for g in &mut self.leading_groups {
            g.visit_form_ids_mut(f);
        }
        for r in &mut self.records {
            r.visit_form_ids_mut(f);
        }
    }

    /// 按身份叠加另一分组的全部记录，后来者取胜
    pub fn overlay(&mut self, other: Group, arena: &FormIdArena) {
        self.leading_groups.extend(other.leading_groups);
        for record in other.records {
            self.upsert(record, arena);
        }
    }

    /// 重建身份索引（记录经外部批量改写后调用）
    pub fn rebuild_index(&mut self, arena: &FormIdArena) {
        self.by_form.clear();
        self.by_edid.clear();
        for (idx, record) in self.records.iter().enumerate() {
            self.by_form.insert(arena.key(record.form_id).clone(), idx);
            if let Some(edid) = record.editor_id() {
                self.by_edid.insert(edid.to_string(), idx);
            }
        }
    }

    /// 递归重建身份索引（含前导子分组与记录的子分组）
    pub fn rebuild_index_recursive(&mut self, arena: &FormIdArena) {
        for g in &mut self.leading_groups {
            g.rebuild_index_recursive(arena);
        }
        for r in &mut self.records {
            if let Some(child) = &mut r.child_group {
                child.rebuild_index_recursive(arena);
            }
        }
        self.rebuild_index(arena);
    }
}
