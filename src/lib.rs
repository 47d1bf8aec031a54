//! Bethesda 插件文件（ESP/ESM/ESL）的解析、合并与重写库
//!
//! 核心能力：
//! - 记录/子记录/分组三层二进制编解码，未建模类型位级往返
//! - 基于原型的子记录布局描述与结构化编辑
//! - 跨插件引用身份化（FormKey / FormId 驻留表）
//! - 按加载顺序的三方合并补丁构建与冲突报告

pub mod context;
pub mod cursor;
pub mod datatypes;
pub mod element;
pub mod formid;
pub mod group;
pub mod merge;
pub mod patcher;
pub mod plugin;
pub mod prototype;
pub mod record;
pub mod records;
pub mod strings;
pub mod utils;

pub use context::{CompressionPolicy, LoadOrder, PatchContext};
pub use element::{Element, ElementSpec, FieldSpec, ListMerge, SubrecordContainer, Value, ValueKind};
pub use formid::{FormId, FormIdArena, FormKey, ModListing};
pub use group::Group;
pub use merge::{merge_record, ConflictEntry, MergeReport, SkippedPlugin};
pub use patcher::{build_patch, merge_plugins};
pub use plugin::Plugin;
pub use prototype::{Prototype, Slot};
pub use record::{Record, RecordBody};
pub use strings::{StringTable, StringTableKind, StringTableSet};
pub use utils::EspError;
