use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use esp_patcher::{build_patch, CompressionPolicy, LoadOrder, PatchContext, Plugin};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "esp_patcher")]
#[command(about = "Bethesda 插件合并补丁工具", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 把多个插件按加载顺序合并为一个补丁插件
    Merge {
        /// 源插件文件，按加载顺序给出（或用 --load-order 指定）
        sources: Vec<PathBuf>,
        /// 输出补丁文件路径
        #[arg(short, long)]
        output: PathBuf,
        /// 加载顺序文件（plugins.txt 格式），缺省按参数次序
        #[arg(long)]
        load_order: Option<PathBuf>,
        /// 本地化字符串表目录
        #[arg(long)]
        strings_dir: Option<PathBuf>,
        /// 字符串表语言后缀
        #[arg(long, default_value = "English")]
        language: String,
        /// 压缩记录一律明文导出
        #[arg(long)]
        no_compress: bool,
        /// 主列表穷举全部导入插件
        #[arg(long)]
        exhaustive_masters: bool,
        /// 合并报告输出路径（JSON），缺省打印到标准输出
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// 打印插件的结构统计
    Stats {
        /// 插件文件路径
        plugin: PathBuf,
    },
    /// 解析后原样重写（编解码往返验证）
    Roundtrip {
        /// 插件文件路径
        plugin: PathBuf,
        /// 输出路径
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Merge {
            sources,
            output,
            load_order,
            strings_dir,
            language,
            no_compress,
            exhaustive_masters,
            report,
        } => {
            let load_order = match load_order {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("读取加载顺序文件失败: {}", path.display()))?;
                    LoadOrder::parse(&text)
                }
                None => {
                    let names: Vec<String> = sources
                        .iter()
                        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                        .collect();
                    LoadOrder::from_names(&names)
                }
            };

            let ctx = PatchContext {
                load_order,
                language,
                compression: if no_compress {
                    CompressionPolicy::Never
                } else {
                    CompressionPolicy::Preserve
                },
                exhaustive_masters,
                strings_dir,
            };

            let patch_name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("输出路径缺少文件名")?;

            let (mut patch, merge_report) = build_patch(&ctx, &sources, &patch_name)?;
            patch
                .save(&output, &ctx)
                .with_context(|| format!("写出补丁失败: {}", output.display()))?;

            let json = serde_json::to_string_pretty(&merge_report)?;
            match report {
                Some(path) => fs::write(&path, json)
                    .with_context(|| format!("写出报告失败: {}", path.display()))?,
                None => println!("{}", json),
            }

            println!(
                "补丁已生成: {} ({} 条记录, {} 处冲突, 跳过 {} 个插件)",
                output.display(),
                patch.count_records(),
                merge_report.conflicts.len(),
                merge_report.skipped_plugins.len()
            );
        }
        Commands::Stats { plugin } => {
            let ctx = PatchContext::default();
            let loaded = Plugin::load(&plugin, &ctx)
                .with_context(|| format!("加载插件失败: {}", plugin.display()))?;

            println!("插件: {}", loaded.name);
            println!("版本: {}", loaded.version);
            if let Some(author) = &loaded.author {
                println!("作者: {}", author);
            }
            println!("主文件: {:?}", loaded.masters);
            println!("本地化: {}", loaded.is_localized());
            println!("记录总数: {}", loaded.count_records());
            for group in loaded.groups() {
                println!(
                    "  {} - {} 条记录",
                    String::from_utf8_lossy(&group.label),
                    group.count_records()
                );
            }
        }
        Commands::Roundtrip { plugin, output } => {
            let ctx = PatchContext::default();
            let mut loaded = Plugin::load(&plugin, &ctx)
                .with_context(|| format!("加载插件失败: {}", plugin.display()))?;
            let bytes = loaded.export(&ctx)?;

            let original = fs::read(&plugin)?;
            if bytes == original {
                println!("往返一致: {} 字节", bytes.len());
            } else {
                println!(
                    "往返存在差异: 原始 {} 字节, 重写 {} 字节",
                    original.len(),
                    bytes.len()
                );
            }
            fs::write(&output, bytes)
                .with_context(|| format!("写出失败: {}", output.display()))?;
        }
    }

    Ok(())
}
