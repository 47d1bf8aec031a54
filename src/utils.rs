use thiserror::Error;
use std::path::Path;

/// 自定义错误类型
///
/// 解析期错误（MalformedRecord 等）携带记录类型上下文，
/// 导出期错误（DuplicateIdentifier / MissingMasterDependency）携带插件名上下文。
#[derive(Error, Debug)]
pub enum EspError {
    #[error("Malformed record {record_type}: {reason}")]
    MalformedRecord {
        record_type: String,
        reason: String,
    },

    #[error("Unexpected field value in {record_type}.{field}: {value}")]
    UnexpectedFieldValue {
        record_type: String,
        field: String,
        value: String,
    },

    #[error("Corrupt plugin header: {0}")]
    CorruptPluginHeader(String),

    #[error("Missing master dependency: {plugin} requires {master}")]
    MissingMasterDependency {
        plugin: String,
        master: String,
    },

    #[error("Duplicate identifier in {plugin}: {reason}")]
    DuplicateIdentifier {
        plugin: String,
        reason: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EspError {
    /// 构造解析错误的便捷方法
    pub fn malformed(record_type: impl Into<String>, reason: impl Into<String>) -> Self {
        EspError::MalformedRecord {
            record_type: record_type.into(),
            reason: reason.into(),
        }
    }
}

/// 创建文件备份
///
/// 覆盖写入插件文件之前调用，备份文件名带时间戳。
pub fn create_backup(file_path: &Path) -> Result<std::path::PathBuf, EspError> {
    if !file_path.exists() {
        return Err(EspError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "原文件不存在",
        )));
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    let backup_path = file_path.with_extension(format!("{}.bak", timestamp));

    std::fs::copy(file_path, &backup_path).map_err(EspError::Io)?;

    Ok(backup_path)
}
