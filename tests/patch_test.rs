//! 端到端补丁构建测试：合成插件字节 → 导入 → 合并 → 导出 → 重新解析验证

use esp_patcher::merge::MergeReport;
use esp_patcher::record::RecordBody;
use esp_patcher::{
    build_patch, merge_plugins, Element, FormKey, LoadOrder, PatchContext, Plugin, Value,
};
use std::fs;

// ---- 合成字节构造 ----

fn chunk(tag: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(tag);
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn zstring(text: &str) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.push(0);
    out
}

fn record(tag: &[u8; 4], raw_form_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&raw_form_id.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&44u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn group(label: &[u8; 4], group_type: i32, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"GRUP");
    out.extend_from_slice(&((24 + content.len()) as u32).to_le_bytes());
    out.extend_from_slice(label);
    out.extend_from_slice(&group_type.to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(content);
    out
}

fn plugin_file(masters: &[&str], groups: &[Vec<u8>]) -> Vec<u8> {
    let mut header_payload = Vec::new();
    let mut hedr = Vec::new();
    hedr.extend_from_slice(&1.71f32.to_le_bytes());
    hedr.extend_from_slice(&0u32.to_le_bytes());
    hedr.extend_from_slice(&0x800u32.to_le_bytes());
    header_payload.extend_from_slice(&chunk(b"HEDR", &hedr));
    for m in masters {
        header_payload.extend_from_slice(&chunk(b"MAST", &zstring(m)));
        header_payload.extend_from_slice(&chunk(b"DATA", &0u64.to_le_bytes()));
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"TES4");
    out.extend_from_slice(&(header_payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&header_payload);
    for g in groups {
        out.extend_from_slice(g);
    }
    out
}

fn weap_record(
    edid: &str,
    raw_form_id: u32,
    value: i32,
    weight: f32,
    damage: u16,
    keywords: &[u32],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&chunk(b"EDID", &zstring(edid)));
    payload.extend_from_slice(&chunk(b"KSIZ", &(keywords.len() as u32).to_le_bytes()));
    for kw in keywords {
        payload.extend_from_slice(&chunk(b"KWDA", &kw.to_le_bytes()));
    }
    let mut data = Vec::new();
    data.extend_from_slice(&value.to_le_bytes());
    data.extend_from_slice(&weight.to_le_bytes());
    data.extend_from_slice(&damage.to_le_bytes());
    payload.extend_from_slice(&chunk(b"DATA", &data));
    record(b"WEAP", raw_form_id, &payload)
}

fn lvli_record(edid: &str, raw_form_id: u32, entries: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&chunk(b"EDID", &zstring(edid)));
    payload.extend_from_slice(&chunk(b"LVLD", &[50u8]));
    payload.extend_from_slice(&chunk(b"LVLF", &[0u8]));
    payload.extend_from_slice(&chunk(b"LLCT", &[entries.len() as u8]));
    for (level, reference, count) in entries {
        let mut entry = Vec::new();
        entry.extend_from_slice(&level.to_le_bytes());
        entry.extend_from_slice(&reference.to_le_bytes());
        entry.extend_from_slice(&count.to_le_bytes());
        payload.extend_from_slice(&chunk(b"LVLO", &entry));
    }
    record(b"LVLI", raw_form_id, &payload)
}

fn dial_with_info(
    edid: &str,
    dial_form_id: u32,
    info_form_id: u32,
    response_text: &str,
) -> Vec<u8> {
    let mut dial_payload = Vec::new();
    dial_payload.extend_from_slice(&chunk(b"EDID", &zstring(edid)));
    dial_payload.extend_from_slice(&chunk(b"PNAM", &50.0f32.to_le_bytes()));
    let dial = record(b"DIAL", dial_form_id, &dial_payload);

    let mut info_payload = Vec::new();
    info_payload.extend_from_slice(&chunk(b"PNAM", &0u32.to_le_bytes()));
    let mut trdt = Vec::new();
    trdt.extend_from_slice(&0u32.to_le_bytes());
    trdt.extend_from_slice(&50u32.to_le_bytes());
    trdt.push(1u8);
    info_payload.extend_from_slice(&chunk(b"TRDT", &trdt));
    info_payload.extend_from_slice(&chunk(b"NAM1", &zstring(response_text)));
    let info = record(b"INFO", info_form_id, &info_payload);

    let children = group(&dial_form_id.to_le_bytes(), 7, &info);

    let mut content = dial;
    content.extend_from_slice(&children);
    content
}

fn load(name: &str, bytes: &[u8], ctx: &PatchContext) -> Plugin {
    Plugin::from_bytes(name, bytes, ctx).expect("合成插件应能解析")
}

fn weap_data(patch: &Plugin, key: &FormKey) -> Vec<Value> {
    match &patch.find_record(key).expect("记录应存在").body {
        RecordBody::Parsed(c) => c.scalar_values(b"DATA").expect("DATA应存在").to_vec(),
        _ => panic!("应该是已解析记录"),
    }
}

// ---- 测试 ----

#[test]
fn test_file_based_patch_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.esm");
    let a_path = dir.path().join("a.esp");
    let b_path = dir.path().join("b.esp");

    fs::write(
        &base_path,
        plugin_file(
            &[],
            &[group(b"WEAP", 0, &weap_record("IronSword", 0x900, 25, 9.0, 7, &[0x10]))],
        ),
    )
    .unwrap();
    // a 改伤害，b 改价值 —— 不相关改动都应进入补丁
    fs::write(
        &a_path,
        plugin_file(
            &["base.esm"],
            &[group(b"WEAP", 0, &weap_record("IronSword", 0x900, 25, 9.0, 12, &[0x10]))],
        ),
    )
    .unwrap();
    fs::write(
        &b_path,
        plugin_file(
            &["base.esm"],
            &[group(b"WEAP", 0, &weap_record("IronSword", 0x900, 100, 9.0, 7, &[0x10]))],
        ),
    )
    .unwrap();

    let ctx = PatchContext {
        load_order: LoadOrder::from_names(&["base.esm", "a.esp", "b.esp"]),
        ..PatchContext::default()
    };
    let sources = vec![base_path, a_path, b_path];
    let (mut patch, report) = build_patch(&ctx, &sources, "patch.esp").unwrap();

    assert!(report.skipped_plugins.is_empty());
    assert!(report.conflicts.is_empty(), "不相关改动不应报冲突");

    // 写盘后重新加载验证
    let patch_path = dir.path().join("patch.esp");
    patch.save(&patch_path, &ctx).unwrap();
    let reloaded = Plugin::load(&patch_path, &ctx).unwrap();

    let key = FormKey::new("base.esm", 0x900);
    let values = weap_data(&reloaded, &key);
    assert_eq!(values[0], Value::I32(100), "b 的价值改动");
    assert_eq!(values[2], Value::U16(12), "a 的伤害改动");
    assert_eq!(
        reloaded.masters,
        vec!["base.esm".to_string()],
        "补丁只依赖实际引用的插件"
    );
}

#[test]
fn test_corrupt_plugin_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let good_path = dir.path().join("good.esp");
    let bad_path = dir.path().join("bad.esp");

    fs::write(
        &good_path,
        plugin_file(&[], &[group(b"WEAP", 0, &weap_record("Axe", 0x900, 1, 1.0, 1, &[]))]),
    )
    .unwrap();
    fs::write(&bad_path, b"this is not a plugin").unwrap();

    let ctx = PatchContext {
        load_order: LoadOrder::from_names(&["good.esp", "bad.esp"]),
        ..PatchContext::default()
    };
    let (patch, report) =
        build_patch(&ctx, &[good_path, bad_path], "patch.esp").unwrap();

    assert_eq!(report.skipped_plugins.len(), 1, "损坏插件整体跳过");
    assert_eq!(report.skipped_plugins[0].name, "bad.esp");
    assert_eq!(patch.count_records(), 1, "有效插件正常合并");
}

#[test]
fn test_conflicting_edits_reported() {
    let ctx = PatchContext {
        load_order: LoadOrder::from_names(&["base.esm", "a.esp", "b.esp"]),
        ..PatchContext::default()
    };
    let base = plugin_file(
        &[],
        &[group(b"WEAP", 0, &weap_record("Sword", 0x900, 25, 9.0, 7, &[]))],
    );
    let a = plugin_file(
        &["base.esm"],
        &[group(b"WEAP", 0, &weap_record("Sword", 0x900, 25, 9.0, 20, &[]))],
    );
    let b = plugin_file(
        &["base.esm"],
        &[group(b"WEAP", 0, &weap_record("Sword", 0x900, 25, 9.0, 30, &[]))],
    );

    let imported = vec![
        load("base.esm", &base, &ctx),
        load("a.esp", &a, &ctx),
        load("b.esp", &b, &ctx),
    ];
    let (patch, report) =
        merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();

    let values = weap_data(&patch, &FormKey::new("base.esm", 0x900));
    assert_eq!(values[2], Value::U16(30), "冲突时加载顺序靠后者取胜");
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].field, "damage");
    assert_eq!(report.conflicts[0].record_type, "WEAP");
}

#[test]
fn test_keyword_list_merged_by_identity() {
    let ctx = PatchContext {
        load_order: LoadOrder::from_names(&["base.esm", "a.esp", "b.esp"]),
        ..PatchContext::default()
    };
    // base: {0x10, 0x11}; a 加 0x20; b 删 0x11
    let base = plugin_file(
        &[],
        &[group(b"WEAP", 0, &weap_record("Sword", 0x900, 1, 1.0, 1, &[0x10, 0x11]))],
    );
    let a = plugin_file(
        &["base.esm"],
        &[group(b"WEAP", 0, &weap_record("Sword", 0x900, 1, 1.0, 1, &[0x10, 0x11, 0x20]))],
    );
    let b = plugin_file(
        &["base.esm"],
        &[group(b"WEAP", 0, &weap_record("Sword", 0x900, 1, 1.0, 1, &[0x10]))],
    );

    let imported = vec![
        load("base.esm", &base, &ctx),
        load("a.esp", &a, &ctx),
        load("b.esp", &b, &ctx),
    ];
    let (patch, report) =
        merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();
    assert!(report.conflicts.is_empty());

    let record = patch
        .find_record(&FormKey::new("base.esm", 0x900))
        .unwrap();
    let keys: Vec<u32> = match &record.body {
        RecordBody::Parsed(c) => match c.get(b"KSIZ") {
            Some(Element::CountedList(l)) => l
                .entries
                .iter()
                .filter_map(|e| match e {
                    Element::Scalar(s) => match &s.values[0] {
                        Value::FormId(fid) => Some(patch.arena.key(*fid).local),
                        _ => None,
                    },
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    assert_eq!(keys, vec![0x10, 0x20], "a 的新增保留，b 的删除生效");
}

#[test]
fn test_nested_info_merged_in_place() {
    let ctx = PatchContext {
        load_order: LoadOrder::from_names(&["base.esm", "b.esp"]),
        ..PatchContext::default()
    };
    let base = plugin_file(
        &[],
        &[group(b"DIAL", 0, &dial_with_info("Greeting", 0x900, 0x910, "Hello."))],
    );
    let b = plugin_file(
        &["base.esm"],
        &[group(b"DIAL", 0, &dial_with_info("Greeting", 0x900, 0x910, "Hey there."))],
    );

    let imported = vec![load("base.esm", &base, &ctx), load("b.esp", &b, &ctx)];
    let (patch, report) =
        merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();

    // 话题与应答都各计一条
    assert_eq!(patch.count_records(), 2);

    let info = patch
        .find_record(&FormKey::new("base.esm", 0x910))
        .expect("INFO 应随 DIAL 子分组进入补丁");
    let text = match &info.body {
        RecordBody::Parsed(c) => match c.get(b"TRDT") {
            Some(Element::List(l)) => match &l.entries[0] {
                Element::Shell(sh) => match sh.inner.scalar_values(b"NAM1") {
                    Some([Value::LString(ls)]) => ls.text.clone(),
                    other => panic!("NAM1 字段异常: {:?}", other),
                },
                other => panic!("应答条目应是嵌套壳: {:?}", other),
            },
            other => panic!("应答槽位异常: {:?}", other),
        },
        _ => panic!("INFO 应是已解析记录"),
    };
    assert_eq!(text.as_deref(), Some("Hey there."), "有序应答列表整体替换");
    assert!(report.conflicts.is_empty(), "old 未改动时替换不算冲突");
}

#[test]
fn test_merged_leveled_list_splits_on_export() {
    let ctx = PatchContext {
        load_order: LoadOrder::from_names(&["base.esm", "a.esp", "b.esp"]),
        ..PatchContext::default()
    };

    // base 200 条目；a、b 各在其上加 55 条不同条目 → 合并后 310 条，超出上限
    let base_entries: Vec<(u32, u32, u32)> =
        (0..200).map(|i| (1, 0x2000 + i, 1)).collect();
    let mut a_entries = base_entries.clone();
    a_entries.extend((0..55).map(|i| (1, 0x3000 + i, 1)));
    let mut b_entries = base_entries.clone();
    b_entries.extend((0..55).map(|i| (1, 0x4000 + i, 1)));

    let base = plugin_file(
        &[],
        &[group(b"LVLI", 0, &lvli_record("LootList", 0x900, &base_entries))],
    );
    let a = plugin_file(
        &["base.esm"],
        &[group(b"LVLI", 0, &lvli_record("LootList", 0x900, &a_entries))],
    );
    let b = plugin_file(
        &["base.esm"],
        &[group(b"LVLI", 0, &lvli_record("LootList", 0x900, &b_entries))],
    );

    let imported = vec![
        load("base.esm", &base, &ctx),
        load("a.esp", &a, &ctx),
        load("b.esp", &b, &ctx),
    ];
    let (mut patch, report) =
        merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();
    assert!(report.conflicts.is_empty());

    let bytes = patch.export(&ctx).unwrap();
    let reparsed = Plugin::from_bytes("patch.esp", &bytes, &ctx).unwrap();
    assert_eq!(reparsed.count_records(), 2, "超容量列表拆分为父记录加延续记录");

    let entries_of = |record: &esp_patcher::Record| -> Vec<(u32, FormKey, u32)> {
        match &record.body {
            RecordBody::Parsed(c) => match c.get(b"LLCT") {
                Some(Element::CountedList(l)) => l
                    .entries
                    .iter()
                    .filter_map(|e| match e {
                        Element::Scalar(s) => match (&s.values[0], &s.values[1], &s.values[2]) {
                            (Value::U32(lv), Value::FormId(fid), Value::U32(ct)) => {
                                Some((*lv, reparsed.arena.key(*fid).clone(), *ct))
                            }
                            _ => None,
                        },
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    };

    let parent = reparsed.find_by_edid("LootList").unwrap();
    let continuation = reparsed.find_by_edid("LootList_Cont1").unwrap();
    let parent_entries = entries_of(parent);
    let cont_entries = entries_of(continuation);

    assert_eq!(parent_entries.len(), 255);
    assert_eq!(cont_entries.len(), 310 - 254);

    // 父记录末尾是指向延续记录的链接条目
    let continuation_key = reparsed.arena.key(continuation.form_id).clone();
    let link = parent_entries.last().unwrap();
    assert_eq!(link.0, 1, "链接条目等级为1");
    assert_eq!(link.1, continuation_key, "链接条目指向延续记录");
    assert_eq!(link.2, 1, "链接条目数量为1");

    // 条目总量守恒（去掉链接条目）
    assert_eq!(parent_entries.len() - 1 + cont_entries.len(), 310);
}
