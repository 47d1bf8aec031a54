use crate::element::{ElementSpec, FieldSpec, ListMerge, MarkerVariant, ValueKind};
use crate::prototype::{Prototype, Slot};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// 分级列表单条 LVLO 容量上限（计数字段1字节宽）
pub const LEVELED_LIST_MAX_ENTRIES: usize = 255;

fn edid_slot() -> Slot {
    Slot::new(
        "editor_id",
        vec![*b"EDID"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("editor_id", ValueKind::ZString)],
        },
    )
}

fn full_name_slot() -> Slot {
    Slot::new(
        "full_name",
        vec![*b"FULL"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("name", ValueKind::LString)],
        },
    )
}

/// 物品类记录的公共布局：EDID + FULL
fn item_base() -> Prototype {
    let mut proto = Prototype::new();
    proto.append(edid_slot());
    proto.append(full_name_slot());
    proto
}

fn keywords_slot() -> Slot {
    Slot::new(
        "keywords",
        vec![*b"KSIZ", *b"KWDA"],
        ElementSpec::CountedList {
            counter_tag: *b"KSIZ",
            counter_width: 4,
            entry_tag: *b"KWDA",
            entry: Arc::new(ElementSpec::Scalar {
                fields: vec![FieldSpec::required("keyword", ValueKind::FormId)],
            }),
            merge: ListMerge::Keyed { key_field: 0 },
        },
    )
}

fn glob_prototype() -> Prototype {
    let mut proto = Prototype::new();
    proto.append(edid_slot());
    proto.append(Slot::new(
        "kind",
        vec![*b"FNAM"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("kind", ValueKind::U8)],
        },
    ));
    proto.append(Slot::new(
        "value",
        vec![*b"FLTV"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("value", ValueKind::F32)],
        },
    ));
    proto
}

fn kywd_prototype() -> Prototype {
    let mut proto = Prototype::new();
    proto.append(edid_slot());
    proto.append(Slot::new(
        "color",
        vec![*b"CNAM"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("color", ValueKind::U32)],
        },
    ));
    proto
}

fn book_prototype() -> Prototype {
    let mut proto = Prototype::derive_from(&item_base());
    proto.append(Slot::new(
        "description",
        vec![*b"DESC"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("description", ValueKind::LString)],
        },
    ));
    proto.append(keywords_slot());

    // 教学效果：技能书或法术书，按最近标记取分支
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
    proto
}

fn weap_prototype() -> Prototype {
    let mut proto = Prototype::derive_from(&item_base());

    // 模型组：无包装标签的嵌套壳
    let mut model_proto = Prototype::new();
    model_proto.append(Slot::new(
        "model_path",
        vec![*b"MODL"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("path", ValueKind::ZString)],
        },
    ));
    model_proto.append(Slot::new(
        "model_data",
        vec![*b"MODT"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("data", ValueKind::Tail)],
        },
    ));
    proto.append(Slot::new(
        "model",
        vec![*b"MODL", *b"MODT"],
        ElementSpec::Shell {
            proto: Arc::new(model_proto),
        },
    ));

    proto.append(keywords_slot());
    proto.append(Slot::new(
        "data",
        vec![*b"DATA"],
        ElementSpec::Scalar {
            fields: vec![
                FieldSpec::required("value", ValueKind::I32),
                FieldSpec::required("weight", ValueKind::F32),
                FieldSpec::required("damage", ValueKind::U16),
            ],
        },
    ));
    // DNAM 尾部字段是后期版本加入的，旧文件里缺失
    proto.append(Slot::new(
        "extended_data",
        vec![*b"DNAM"],
        ElementSpec::Scalar {
            fields: vec![
                FieldSpec::required("speed", ValueKind::F32),
                FieldSpec::required("reach", ValueKind::F32),
                FieldSpec::required("flags", ValueKind::Flags32),
                FieldSpec::optional("crit_damage", ValueKind::U32),
            ],
        },
    ));
    proto
}

fn lvli_prototype() -> Prototype {
    let mut proto = Prototype::new();
    proto.append(edid_slot());
    proto.append(Slot::new(
        "chance_none",
        vec![*b"LVLD"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("chance_none", ValueKind::U8)],
        },
    ));
    proto.append(Slot::new(
        "list_flags",
        vec![*b"LVLF"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("flags", ValueKind::Flags8)],
        },
    ));
    // 条目按引用字段为身份键合并
    let mut entries_slot = Slot::new(
        "entries",
        vec![*b"LLCT", *b"LVLO"],
        ElementSpec::CountedList {
            counter_tag: *b"LLCT",
            counter_width: 1,
            entry_tag: *b"LVLO",
            entry: Arc::new(ElementSpec::Scalar {
                fields: vec![
                    FieldSpec::required("level", ValueKind::U32),
                    FieldSpec::required("reference", ValueKind::FormId),
                    FieldSpec::required("count", ValueKind::U32),
                ],
            }),
            merge: ListMerge::Keyed { key_field: 1 },
        },
    );
    // 空列表也要写出计数0
    entries_slot.force_export = true;
    proto.append(entries_slot);
    proto
}

fn dial_prototype() -> Prototype {
    let mut proto = Prototype::new();
    proto.append(edid_slot());
    proto.append(full_name_slot());
    proto.append(Slot::new(
        "priority",
        vec![*b"PNAM"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("priority", ValueKind::F32)],
        },
    ));
    proto
}

fn info_prototype() -> Prototype {
    let mut proto = Prototype::new();
    proto.append(edid_slot());
    proto.append(Slot::new(
        "previous_info",
        vec![*b"PNAM"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("previous_info", ValueKind::FormId)],
        },
    ));
    // 条件块族：结构不建模，同族连续块原样保留、整体比较
    proto.append(Slot::new(
        "conditions",
        vec![*b"CTDA", *b"CIS1", *b"CIS2"],
        ElementSpec::Bulk {
            family: vec![*b"CTDA", *b"CIS1", *b"CIS2"],
        },
    ));
    // 响应列表：TRDT 开启新条目，有序整体替换
    let mut response_proto = Prototype::new();
    response_proto.append(Slot::new(
        "response_data",
        vec![*b"TRDT"],
        ElementSpec::Scalar {
            fields: vec![
                FieldSpec::required("emotion_type", ValueKind::U32),
                FieldSpec::required("emotion_value", ValueKind::U32),
                FieldSpec::required("response_number", ValueKind::U8),
            ],
        },
    ));
    response_proto.append(Slot::new(
        "response_text",
        vec![*b"NAM1"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("text", ValueKind::LString)],
        },
    ));
    response_proto.append(Slot::new(
        "script_notes",
        vec![*b"NAM2"],
        ElementSpec::Scalar {
            fields: vec![FieldSpec::required("notes", ValueKind::ZString)],
        },
    ));
    proto.append(Slot::new(
        "responses",
        vec![*b"TRDT", *b"NAM1", *b"NAM2"],
        ElementSpec::List {
            entry: Arc::new(ElementSpec::Shell {
                proto: Arc::new(response_proto),
            }),
            merge: ListMerge::Replace,
        },
    ));
    proto
}

fn registry() -> &'static HashMap<[u8; 4], Arc<Prototype>> {
    static REGISTRY: OnceLock<HashMap<[u8; 4], Arc<Prototype>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(*b"GLOB", Arc::new(glob_prototype()));
        map.insert(*b"KYWD", Arc::new(kywd_prototype()));
        map.insert(*b"BOOK", Arc::new(book_prototype()));
        map.insert(*b"WEAP", Arc::new(weap_prototype()));
        map.insert(*b"LVLI", Arc::new(lvli_prototype()));
        map.insert(*b"DIAL", Arc::new(dial_prototype()));
        map.insert(*b"INFO", Arc::new(info_prototype()));
        map
    })
}

/// 已注册记录类型的原型（未注册类型返回 None，记录体原样保留）
pub fn prototype_for(tag: &[u8; 4]) -> Option<Arc<Prototype>> {
    registry().get(tag).cloned()
}

/// 是否为受容量拆分约束的分级列表类型
pub fn is_leveled_list(tag: &[u8; 4]) -> bool {
    tag == b"LVLI"
}

/// 全部已注册类型标签
pub fn registered_types() -> Vec<[u8; 4]> {
    let mut tags: Vec<[u8; 4]> = registry().keys().copied().collect();
    tags.sort();
    tags
}
