use crate::context::PatchContext;
use crate::formid::FormKey;
use crate::merge::{merge_record, MergeReport, SkippedPlugin};
use crate::plugin::Plugin;
use crate::record::{Record, RecordBody};
use crate::utils::EspError;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;

/// 从磁盘构建合并补丁
///
/// 导入阶段并行解析，单个插件失败不中断整体，记入报告的跳过列表。
pub fn build_patch(
    ctx: &PatchContext,
    sources: &[PathBuf],
    patch_name: &str,
) -> Result<(Plugin, MergeReport), EspError> {
    let results: Vec<Result<Plugin, SkippedPlugin>> = sources
        .par_iter()
        .map(|path| {
            Plugin::load(path, ctx).map_err(|e| SkippedPlugin {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
                error: e.to_string(),
            })
        })
        .collect();

    let mut report = MergeReport::default();
    let mut imported = Vec::new();
    for result in results {
        match result {
            Ok(plugin) => imported.push(plugin),
            Err(skipped) => report.skipped_plugins.push(skipped),
        }
    }

    merge_plugins(ctx, imported, patch_name, report)
}

/// 把已导入的插件按加载顺序折叠为一个补丁插件
///
/// 每个记录身份第一次出现的版本既作为补丁里的初始副本也作为后续
/// 合并的 base；之后每次出现都做 old/new/base 三方合并。
pub fn merge_plugins(
    ctx: &PatchContext,
    mut imported: Vec<Plugin>,
    patch_name: &str,
    mut report: MergeReport,
) -> Result<(Plugin, MergeReport), EspError> {
    // 主依赖检查：主文件必须出现在加载顺序中
    if !ctx.load_order.is_empty() {
        imported.retain(|p| {
            for master in &p.masters {
                if !ctx.load_order.contains(master) {
                    report.skipped_plugins.push(SkippedPlugin {
                        name: p.name.clone(),
                        error: EspError::MissingMasterDependency {
                            plugin: p.name.clone(),
                            master: master.clone(),
                        }
                        .to_string(),
                    });
                    return false;
                }
            }
            true
        });
    }

    // 严格按加载顺序折叠；加载顺序之外的插件按给定次序排在最后
    let mut order: Vec<usize> = (0..imported.len()).collect();
    order.sort_by_key(|&i| {
        (
            ctx.load_order.index_of(&imported[i].name).unwrap_or(usize::MAX),
            i,
        )
    });

    let mut patch = Plugin::new(patch_name);
    if ctx.exhaustive_masters {
        for &pi in &order {
            let name = imported[pi].name.clone();
            if !patch.masters.iter().any(|m| m.eq_ignore_ascii_case(&name)) {
                patch.masters.push(name);
            }
        }
    }

    // 每个身份首次出现的版本：(导入下标, 记录快照)
    let mut bases: HashMap<FormKey, (usize, Record)> = HashMap::new();

    for &pi in &order {
        let plugin = &imported[pi];

        let mut keys: Vec<FormKey> = Vec::new();
        for group in plugin.groups() {
            group.for_each_record(&mut |r| {
                if matches!(r.body, RecordBody::Parsed(_)) {
                    keys.push(plugin.arena.key(r.form_id).clone());
                }
            });
        }

        for key in keys {
            let Some(record) = plugin.find_record(&key) else {
                continue;
            };
            match patch.record_and_arena_mut(&key) {
                Some((old, old_arena)) => {
                    let Some((base_idx, base_record)) = bases.get(&key) else {
                        // 记录随某个父记录的子分组进入补丁但未单独登记过
                        register_bases(record, pi, &mut bases, plugin);
                        continue;
                    };
                    merge_record(
                        old,
                        old_arena,
                        record,
                        &plugin.arena,
                        base_record,
                        &imported[*base_idx].arena,
                        &mut report,
                    )?;
                }
                None => {
                    let copy = record.copy_for_override(&plugin.arena, &mut patch.arena)?;
                    patch.add_record(copy);
                    report.copied_records += 1;
                    register_bases(record, pi, &mut bases, plugin);
                }
            }
        }
    }

    Ok((patch, report))
}

/// 登记记录及其子分组内全部记录的 base 快照
fn register_bases(
    record: &Record,
    plugin_idx: usize,
    bases: &mut HashMap<FormKey, (usize, Record)>,
    plugin: &Plugin,
) {
    let key = plugin.arena.key(record.form_id).clone();
    bases.entry(key).or_insert_with(|| (plugin_idx, record.clone()));
    if let Some(group) = &record.child_group {
        group.for_each_record(&mut |child| {
            register_bases(child, plugin_idx, bases, plugin);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LoadOrder;
    use crate::element::{write_chunk, Value};
    use crate::record::RecordBody;

    fn glob_record_bytes(edid: &str, raw_form_id: u32, value: f32) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut edid_bytes = edid.as_bytes().to_vec();
        edid_bytes.push(0);
        write_chunk(&mut payload, b"EDID", &edid_bytes).unwrap();
        write_chunk(&mut payload, b"FNAM", &[0u8]).unwrap();
        write_chunk(&mut payload, b"FLTV", &value.to_le_bytes()).unwrap();

        let mut out = Vec::new();
        out.extend_from_slice(b"GLOB");
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&raw_form_id.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&44u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn plugin_bytes(masters: &[&str], records: &[Vec<u8>]) -> Vec<u8> {
        let mut header_payload = Vec::new();
        let mut hedr = Vec::new();
        hedr.extend_from_slice(&1.71f32.to_le_bytes());
        hedr.extend_from_slice(&(records.len() as u32).to_le_bytes());
        hedr.extend_from_slice(&0x800u32.to_le_bytes());
        write_chunk(&mut header_payload, b"HEDR", &hedr).unwrap();
        for m in masters {
            write_chunk(
                &mut header_payload,
                b"MAST",
                &crate::datatypes::encode_zstring(m),
            )
            .unwrap();
            write_chunk(&mut header_payload, b"DATA", &0u64.to_le_bytes()).unwrap();
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"TES4");
        out.extend_from_slice(&(header_payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&header_payload);

        if !records.is_empty() {
            let mut content = Vec::new();
            for r in records {
                content.extend_from_slice(r);
            }
            out.extend_from_slice(b"GRUP");
            out.extend_from_slice(&((24 + content.len()) as u32).to_le_bytes());
            out.extend_from_slice(b"GLOB");
            out.extend_from_slice(&0i32.to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&content);
        }
        out
    }

    fn glob_value(patch: &Plugin, key: &FormKey) -> f32 {
        match &patch.find_record(key).unwrap().body {
            RecordBody::Parsed(c) => match c.scalar_values(b"FLTV").unwrap() {
                [Value::F32(v)] => *v,
                other => panic!("FLTV 字段异常: {:?}", other),
            },
            _ => panic!("应该是已解析记录"),
        }
    }

    #[test]
    fn test_later_plugin_wins_over_base() {
        let ctx = PatchContext {
            load_order: LoadOrder::from_names(&["base.esm", "a.esp", "b.esp"]),
            ..PatchContext::default()
        };
        // base 定义记录；a 不改动；b 改值
        let base = plugin_bytes(&[], &[glob_record_bytes("G", 0x0000_0900, 1.0)]);
        let a = plugin_bytes(&["base.esm"], &[glob_record_bytes("G", 0x0000_0900, 1.0)]);
        let b = plugin_bytes(&["base.esm"], &[glob_record_bytes("G", 0x0000_0900, 5.0)]);

        let imported = vec![
            Plugin::from_bytes("base.esm", &base, &ctx).unwrap(),
            Plugin::from_bytes("a.esp", &a, &ctx).unwrap(),
            Plugin::from_bytes("b.esp", &b, &ctx).unwrap(),
        ];
        let (patch, report) =
            merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();

        assert_eq!(glob_value(&patch, &FormKey::new("base.esm", 0x900)), 5.0);
        assert_eq!(report.copied_records, 1);
        assert_eq!(report.unchanged_records, 1);
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn test_missing_master_skips_plugin() {
        let ctx = PatchContext {
            load_order: LoadOrder::from_names(&["base.esm", "a.esp"]),
            ..PatchContext::default()
        };
        let a = plugin_bytes(
            &["NotInOrder.esm"],
            &[glob_record_bytes("G", 0x0100_0900, 1.0)],
        );
        let imported = vec![Plugin::from_bytes("a.esp", &a, &ctx).unwrap()];

        let (patch, report) =
            merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();

        assert_eq!(patch.count_records(), 0);
        assert_eq!(report.skipped_plugins.len(), 1);
        assert!(report.skipped_plugins[0].error.contains("NotInOrder.esm"));
    }

    #[test]
    fn test_exhaustive_masters_lists_all_imported() {
        let ctx = PatchContext {
            load_order: LoadOrder::from_names(&["base.esm", "a.esp"]),
            exhaustive_masters: true,
            ..PatchContext::default()
        };
        let base = plugin_bytes(&[], &[glob_record_bytes("G", 0x0000_0900, 1.0)]);
        let a = plugin_bytes(&["base.esm"], &[]);
        let imported = vec![
            Plugin::from_bytes("base.esm", &base, &ctx).unwrap(),
            Plugin::from_bytes("a.esp", &a, &ctx).unwrap(),
        ];

        let (patch, _) =
            merge_plugins(&ctx, imported, "patch.esp", MergeReport::default()).unwrap();
        assert_eq!(
            patch.masters,
            vec!["base.esm".to_string(), "a.esp".to_string()],
            "穷举模式列出全部导入插件"
        );
    }
}
