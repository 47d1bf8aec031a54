use crate::element::{
    Element, LString, ScalarElement, SubrecordContainer, Value, ValueKind,
};
use crate::element::ListMerge;
use crate::formid::{FormIdArena, FormKey};
use crate::record::{Record, RecordBody};
use crate::utils::EspError;
use serde::Serialize;
use std::collections::HashMap;

/// 一次字段级冲突：三方都有改动且不一致，后来者取胜
#[derive(Debug, Clone, Serialize)]
pub struct ConflictEntry {
    pub record: String,
    pub record_type: String,
    pub slot: String,
    /// 槽位级原子冲突时为 "*"
    pub field: String,
    pub old: String,
    pub new: String,
    pub base: String,
    pub winner: String,
}

/// 因加载失败或主依赖缺失被整体跳过的插件
#[derive(Debug, Clone, Serialize)]
pub struct SkippedPlugin {
    pub name: String,
    pub error: String,
}

/// 合并结果汇总（可序列化为 JSON 报告）
#[derive(Debug, Default, Serialize)]
pub struct MergeReport {
    pub merged_records: usize,
    pub unchanged_records: usize,
    pub copied_records: usize,
    pub conflicts: Vec<ConflictEntry>,
    pub skipped_plugins: Vec<SkippedPlugin>,
}

struct ConflictSite<'a> {
    record: &'a str,
    record_type: &'a str,
    slot: &'a str,
}

impl ConflictSite<'_> {
    fn entry(
        &self,
        field: impl Into<String>,
        old: String,
        new: String,
        base: String,
    ) -> ConflictEntry {
        ConflictEntry {
            record: self.record.to_string(),
            record_type: self.record_type.to_string(),
            slot: self.slot.to_string(),
            field: field.into(),
            old,
            new,
            base,
            winner: "new".to_string(),
        }
    }
}

/// 三方合并一条记录：old 是累积结果，new 是后来的覆盖，base 是最初版本
///
/// 标量规则：new 相对 base 有改动则取 new，否则保留 old。标志字逐位适用
/// 同一规则。身份键列表按键对齐：new 新增的保留，base 有而 new 删掉的
/// 从 old 移除，键相同的条目递归按字段合并。有序列表与未建模块整体替换。
pub fn merge_record(
    old: &mut Record,
    old_arena: &mut FormIdArena,
    new: &Record,
    new_arena: &FormIdArena,
    base: &Record,
    base_arena: &FormIdArena,
    report: &mut MergeReport,
) -> Result<(), EspError> {
    // 整树相等短路：new 未做任何改动
    if record_eq(new, new_arena, base, base_arena) {
        report.unchanged_records += 1;
        return Ok(());
    }

    let record_label = old_arena.key(old.form_id).to_string();
    let type_label = crate::datatypes::tag_to_string(&old.record_type);

    // 头部标志逐位合并
    let diff = new.flags ^ base.flags;
    let overlap = (old.flags ^ base.flags) & diff & (old.flags ^ new.flags);
    if overlap != 0 {
        let site = ConflictSite {
            record: &record_label,
            record_type: &type_label,
            slot: "header",
        };
        report.conflicts.push(site.entry(
            "flags",
            format!("{:#010X}", old.flags),
            format!("{:#010X}", new.flags),
            format!("{:#010X}", base.flags),
        ));
    }
    old.flags = (old.flags & !diff) | (new.flags & diff);

    merge_copy_field(&mut old.timestamp, new.timestamp, base.timestamp);
    merge_copy_field(&mut old.version_control_info, new.version_control_info, base.version_control_info);
    merge_copy_field(&mut old.internal_version, new.internal_version, base.internal_version);

    match (&mut old.body, &new.body, &base.body) {
        (RecordBody::Parsed(o), RecordBody::Parsed(n), RecordBody::Parsed(b)) => {
            merge_container(
                o,
                old_arena,
                n,
                new_arena,
                Some(b),
                base_arena,
                &record_label,
                &type_label,
                report,
            )?;
        }
        // 任何一方未解析：记录体整体替换
        (o_body, n_body, b_body) => {
            if !body_eq(n_body, new_arena, b_body, base_arena) {
                let old_changed = !body_eq(o_body, old_arena, b_body, base_arena);
                let equals_new = body_eq(o_body, old_arena, n_body, new_arena);
                if old_changed && !equals_new {
                    let site = ConflictSite {
                        record: &record_label,
                        record_type: &type_label,
                        slot: "body",
                    };
                    report.conflicts.push(site.entry(
                        "*",
                        "<changed>".to_string(),
                        "<changed>".to_string(),
                        "<base>".to_string(),
                    ));
                }
                *o_body = adopt_body(n_body, new_arena, old_arena);
            }
        }
    }

    report.merged_records += 1;
    Ok(())
}

fn merge_copy_field<T: PartialEq + Copy>(old: &mut T, new: T, base: T) {
    if new != base {
        *old = new;
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_container(
    old: &mut SubrecordContainer,
    old_arena: &mut FormIdArena,
    new: &SubrecordContainer,
    new_arena: &FormIdArena,
    base: Option<&SubrecordContainer>,
    base_arena: &FormIdArena,
    record_label: &str,
    type_label: &str,
    report: &mut MergeReport,
) -> Result<(), EspError> {
    for idx in 0..old.len() {
        let slot_name = old.proto().slots()[idx].name.clone();
        let site = ConflictSite {
            record: record_label,
            record_type: type_label,
            slot: &slot_name,
        };
        let new_slot = new.element_at(idx);
        let base_slot = base.and_then(|b| b.element_at(idx));
        merge_element(
            old.element_at_mut(idx),
            old_arena,
            new_slot,
            new_arena,
            base_slot,
            base_arena,
            &site,
            report,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn merge_element(
    old_slot: &mut Option<Element>,
    old_arena: &mut FormIdArena,
    new_slot: Option<&Element>,
    new_arena: &FormIdArena,
    base_slot: Option<&Element>,
    base_arena: &FormIdArena,
    site: &ConflictSite<'_>,
    report: &mut MergeReport,
) -> Result<(), EspError> {
    // new 未改动该槽位：old 保持
    if opt_elem_eq(new_slot, new_arena, base_slot, base_arena) {
        return Ok(());
    }

    match (old_slot.as_mut(), new_slot) {
        (Some(Element::Scalar(o)), Some(Element::Scalar(n))) => {
            let b = match base_slot {
                Some(Element::Scalar(b)) => Some(b),
                _ => None,
            };
            merge_scalar(o, old_arena, n, new_arena, b, base_arena, site, report);
            return Ok(());
        }
        (Some(Element::Shell(o)), Some(Element::Shell(n))) => {
            let b = match base_slot {
                Some(Element::Shell(b)) => Some(&b.inner),
                _ => None,
            };
            return merge_container(
                &mut o.inner,
                old_arena,
                &n.inner,
                new_arena,
                b,
                base_arena,
                site.record,
                site.record_type,
                report,
            );
        }
        (Some(Element::List(o)), Some(Element::List(n))) => {
            if let ListMerge::Keyed { key_field } = o.merge {
                let b = match base_slot {
                    Some(Element::List(b)) => &b.entries[..],
                    _ => &[],
                };
                merge_keyed_list(
                    &mut o.entries,
                    old_arena,
                    &n.entries,
                    new_arena,
                    b,
                    base_arena,
                    key_field,
                    site,
                    report,
                );
                return Ok(());
            }
        }
        (Some(Element::CountedList(o)), Some(Element::CountedList(n))) => {
            if let ListMerge::Keyed { key_field } = o.merge {
                let b = match base_slot {
                    Some(Element::CountedList(b)) => &b.entries[..],
                    _ => &[],
                };
                merge_keyed_list(
                    &mut o.entries,
                    old_arena,
                    &n.entries,
                    new_arena,
                    b,
                    base_arena,
                    key_field,
                    site,
                    report,
                );
                return Ok(());
            }
        }
        (Some(Element::MarkerSet(o)), Some(Element::MarkerSet(n))) => {
            if let (Some(oa), Some(na)) = (&mut o.active, &n.active) {
                if oa.variant_index == na.variant_index {
                    let base_body = match base_slot {
                        Some(Element::MarkerSet(b)) => b
                            .active
                            .as_ref()
                            .filter(|ba| ba.variant_index == na.variant_index)
                            .map(|ba| &ba.body),
                        _ => None,
                    };
                    return merge_container(
                        &mut oa.body,
                        old_arena,
                        &na.body,
                        new_arena,
                        base_body,
                        base_arena,
                        site.record,
                        site.record_type,
                        report,
                    );
                }
            }
        }
        _ => {}
    }

    // 其余形态（含新增、删除、有序列表、批量块、标记分支切换）整体替换
    let old_changed = !opt_elem_eq(old_slot.as_ref(), old_arena, base_slot, base_arena);
    let equals_new = opt_elem_eq(old_slot.as_ref(), old_arena, new_slot, new_arena);
    if old_changed && !equals_new {
        report.conflicts.push(site.entry(
            "*",
            describe_slot(old_slot.as_ref()),
            describe_slot(new_slot),
            describe_slot(base_slot),
        ));
    }
    *old_slot = new_slot.map(|e| adopt_element(e, new_arena, old_arena));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn merge_scalar(
    old: &mut ScalarElement,
    old_arena: &mut FormIdArena,
    new: &ScalarElement,
    new_arena: &FormIdArena,
    base: Option<&ScalarElement>,
    base_arena: &FormIdArena,
    site: &ConflictSite<'_>,
    report: &mut MergeReport,
) {
    // 字段数不一致（旧格式与新格式混合）或 base 缺失：整体替换
    let base = match base {
        Some(b) if old.values.len() == new.values.len()
            && b.values.len() == new.values.len() =>
        {
            b
        }
        _ => {
            let old_changed = match base {
                Some(b) => !scalar_eq(old, old_arena, b, base_arena),
                None => true,
            };
            let equals_new = scalar_eq(old, old_arena, new, new_arena);
            if old_changed && !equals_new {
                report.conflicts.push(site.entry(
                    "*",
                    format!("<{} fields>", old.values.len()),
                    format!("<{} fields>", new.values.len()),
                    format!("<{} fields>", base.map_or(0, |b| b.values.len())),
                ));
            }
            old.values = new
                .values
                .iter()
                .map(|v| adopt_value(v, new_arena, old_arena))
                .collect();
            return;
        }
    };

    for i in 0..new.values.len() {
        let field = &new.fields[i];
        let n = &new.values[i];
        let b = &base.values[i];

        // 标志字段逐位合并
        if matches!(
            field.kind,
            ValueKind::Flags8 | ValueKind::Flags16 | ValueKind::Flags32
        ) {
            if let (Value::Flags(o_bits), Value::Flags(n_bits), Value::Flags(b_bits)) =
                (&old.values[i], n, b)
            {
                let (o_bits, n_bits, b_bits) = (*o_bits, *n_bits, *b_bits);
                let diff = n_bits ^ b_bits;
                let overlap = (o_bits ^ b_bits) & diff & (o_bits ^ n_bits);
                if overlap != 0 {
                    report.conflicts.push(site.entry(
                        field.name,
                        format!("{:#010X}", o_bits),
                        format!("{:#010X}", n_bits),
                        format!("{:#010X}", b_bits),
                    ));
                }
                old.values[i] = Value::Flags((o_bits & !diff) | (n_bits & diff));
                continue;
            }
        }

        if value_eq(n, new_arena, b, base_arena) {
            continue; // new 未改动该字段
        }
        let o = &old.values[i];
        let old_changed = !value_eq(o, old_arena, b, base_arena);
        if old_changed && !value_eq(o, old_arena, n, new_arena) {
            report.conflicts.push(site.entry(
                field.name,
                render_value(o, old_arena),
                render_value(n, new_arena),
                render_value(b, base_arena),
            ));
        }
        old.values[i] = adopt_value(n, new_arena, old_arena);
    }
}

/// 条目身份键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryKey {
    Form(FormKey),
    Int(u64),
    Text(String),
}

fn entry_key(elem: &Element, arena: &FormIdArena, key_field: usize) -> Option<EntryKey> {
    let Element::Scalar(s) = elem else { return None };
    match s.values.get(key_field)? {
        Value::FormId(fid) => Some(EntryKey::Form(arena.key(*fid).clone())),
        Value::U8(v) => Some(EntryKey::Int(*v as u64)),
        Value::U16(v) => Some(EntryKey::Int(*v as u64)),
        Value::U32(v) => Some(EntryKey::Int(*v as u64)),
        Value::I8(v) => Some(EntryKey::Int(*v as u64)),
        Value::I16(v) => Some(EntryKey::Int(*v as u64)),
        Value::I32(v) => Some(EntryKey::Int(*v as u64)),
        Value::String(s) => Some(EntryKey::Text(s.clone())),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_keyed_list(
    old_entries: &mut Vec<Element>,
    old_arena: &mut FormIdArena,
    new_entries: &[Element],
    new_arena: &FormIdArena,
    base_entries: &[Element],
    base_arena: &FormIdArena,
    key_field: usize,
    site: &ConflictSite<'_>,
    report: &mut MergeReport,
) {
    let base_keys: HashMap<EntryKey, &Element> = base_entries
        .iter()
        .filter_map(|e| entry_key(e, base_arena, key_field).map(|k| (k, e)))
        .collect();
    let new_keys: HashMap<EntryKey, &Element> = new_entries
        .iter()
        .filter_map(|e| entry_key(e, new_arena, key_field).map(|k| (k, e)))
        .collect();

    // base 有而 new 删掉的键从 old 移除
    old_entries.retain(|e| match entry_key(e, old_arena, key_field) {
        Some(k) => !(base_keys.contains_key(&k) && !new_keys.contains_key(&k)),
        None => true,
    });

    for new_entry in new_entries {
        let Some(k) = entry_key(new_entry, new_arena, key_field) else {
            continue;
        };
        let existing = old_entries
            .iter()
            .position(|e| entry_key(e, old_arena, key_field).as_ref() == Some(&k));
        match existing {
            Some(idx) => {
                if let (Element::Scalar(o), Element::Scalar(n)) =
                    (&mut old_entries[idx], new_entry)
                {
                    let b = match base_keys.get(&k) {
                        Some(Element::Scalar(b)) => Some(b),
                        _ => None,
                    };
                    merge_scalar(o, old_arena, n, new_arena, b, base_arena, site, report);
                }
            }
            None => old_entries.push(adopt_element(new_entry, new_arena, old_arena)),
        }
    }
}

/// 跨驻留表元素复制：全部引用重新驻留到目标表
pub fn adopt_element(
    elem: &Element,
    src_arena: &FormIdArena,
    dest_arena: &mut FormIdArena,
) -> Element {
    let mut copy = elem.clone();
    copy.visit_form_ids_mut(&mut |fid| {
        let key = src_arena.key(*fid).clone();
        *fid = dest_arena.intern(key);
    });
    copy
}

fn adopt_value(value: &Value, src_arena: &FormIdArena, dest_arena: &mut FormIdArena) -> Value {
    match value {
        Value::FormId(fid) => Value::FormId(dest_arena.intern(src_arena.key(*fid).clone())),
        other => other.clone(),
    }
}

fn adopt_body(
    body: &RecordBody,
    src_arena: &FormIdArena,
    dest_arena: &mut FormIdArena,
) -> RecordBody {
    match body {
        RecordBody::Raw(bytes) => RecordBody::Raw(bytes.clone()),
        RecordBody::Parsed(container) => {
            let mut copy = container.clone();
            copy.visit_form_ids_mut(&mut |fid| {
                let key = src_arena.key(*fid).clone();
                *fid = dest_arena.intern(key);
            });
            RecordBody::Parsed(copy)
        }
    }
}

// ---- 跨驻留表的结构相等比较 ----

/// 值相等：引用按身份比较，浮点按位模式比较
pub fn value_eq(a: &Value, arena_a: &FormIdArena, b: &Value, arena_b: &FormIdArena) -> bool {
    match (a, b) {
        (Value::FormId(x), Value::FormId(y)) => arena_a.key(*x) == arena_b.key(*y),
        (Value::F32(x), Value::F32(y)) => x.to_bits() == y.to_bits(),
        (Value::LString(x), Value::LString(y)) => lstring_eq(x, y),
        (x, y) => x == y,
    }
}

fn lstring_eq(a: &LString, b: &LString) -> bool {
    if a.id != 0 && b.id != 0 {
        return a.id == b.id;
    }
    a.text == b.text
}

fn scalar_eq(
    a: &ScalarElement,
    arena_a: &FormIdArena,
    b: &ScalarElement,
    arena_b: &FormIdArena,
) -> bool {
    a.values.len() == b.values.len()
        && a.values
            .iter()
            .zip(b.values.iter())
            .all(|(x, y)| value_eq(x, arena_a, y, arena_b))
}

pub fn elem_eq(a: &Element, arena_a: &FormIdArena, b: &Element, arena_b: &FormIdArena) -> bool {
    match (a, b) {
        (Element::Scalar(x), Element::Scalar(y)) => scalar_eq(x, arena_a, y, arena_b),
        (Element::Shell(x), Element::Shell(y)) => {
            container_eq(&x.inner, arena_a, &y.inner, arena_b)
        }
        (Element::List(x), Element::List(y)) => {
            x.entries.len() == y.entries.len()
                && x.entries
                    .iter()
                    .zip(y.entries.iter())
                    .all(|(ex, ey)| elem_eq(ex, arena_a, ey, arena_b))
        }
        (Element::CountedList(x), Element::CountedList(y)) => {
            x.entries.len() == y.entries.len()
                && x.entries
                    .iter()
                    .zip(y.entries.iter())
                    .all(|(ex, ey)| elem_eq(ex, arena_a, ey, arena_b))
        }
        (Element::MarkerSet(x), Element::MarkerSet(y)) => match (&x.active, &y.active) {
            (None, None) => true,
            (Some(ax), Some(ay)) => {
                ax.variant_index == ay.variant_index
                    && ax.marker_data == ay.marker_data
                    && container_eq(&ax.body, arena_a, &ay.body, arena_b)
            }
            _ => false,
        },
        (Element::Bulk(x), Element::Bulk(y)) => x.chunks == y.chunks,
        _ => false,
    }
}

fn opt_elem_eq(
    a: Option<&Element>,
    arena_a: &FormIdArena,
    b: Option<&Element>,
    arena_b: &FormIdArena,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => elem_eq(x, arena_a, y, arena_b),
        _ => false,
    }
}

pub fn container_eq(
    a: &SubrecordContainer,
    arena_a: &FormIdArena,
    b: &SubrecordContainer,
    arena_b: &FormIdArena,
) -> bool {
    a.len() == b.len()
        && (0..a.len()).all(|i| opt_elem_eq(a.element_at(i), arena_a, b.element_at(i), arena_b))
}

fn body_eq(
    a: &RecordBody,
    arena_a: &FormIdArena,
    b: &RecordBody,
    arena_b: &FormIdArena,
) -> bool {
    match (a, b) {
        (RecordBody::Raw(x), RecordBody::Raw(y)) => x == y,
        (RecordBody::Parsed(x), RecordBody::Parsed(y)) => container_eq(x, arena_a, y, arena_b),
        _ => false,
    }
}

/// 记录整树相等（子分组不参与，按记录各自合并）
pub fn record_eq(a: &Record, arena_a: &FormIdArena, b: &Record, arena_b: &FormIdArena) -> bool {
    a.record_type == b.record_type
        && a.flags == b.flags
        && arena_a.key(a.form_id) == arena_b.key(b.form_id)
        && a.timestamp == b.timestamp
        && a.version_control_info == b.version_control_info
        && a.internal_version == b.internal_version
        && body_eq(&a.body, arena_a, &b.body, arena_b)
}

fn render_value(v: &Value, arena: &FormIdArena) -> String {
    match v {
        Value::FormId(fid) => arena.key(*fid).to_string(),
        Value::String(s) => s.clone(),
        Value::LString(l) => l
            .text
            .clone()
            .unwrap_or_else(|| format!("#{:08X}", l.id)),
        Value::F32(x) => x.to_string(),
        Value::Flags(x) => format!("{:#010X}", x),
        other => format!("{:?}", other),
    }
}

fn describe_slot(slot: Option<&Element>) -> String {
    match slot {
        None => "<absent>".to_string(),
        Some(Element::Scalar(s)) => format!("<{} fields>", s.values.len()),
        Some(Element::Shell(_)) => "<shell>".to_string(),
        Some(Element::List(l)) => format!("<{} entries>", l.entries.len()),
        Some(Element::CountedList(l)) => format!("<{} entries>", l.entries.len()),
        Some(Element::MarkerSet(m)) => match m.active_marker() {
            Some(tag) => format!("<marker {}>", crate::datatypes::tag_to_string(&tag)),
            None => "<no marker>".to_string(),
        },
        Some(Element::Bulk(b)) => format!("<{} chunks>", b.chunks.len()),
    }
}
