use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

// 基础整数类型读取函数
pub fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, std::io::Error> {
    cursor.read_u8()
}

pub fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, std::io::Error> {
    cursor.read_u16::<LittleEndian>()
}

pub fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, std::io::Error> {
    cursor.read_u32::<LittleEndian>()
}

pub fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32, std::io::Error> {
    cursor.read_i32::<LittleEndian>()
}

pub fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32, std::io::Error> {
    cursor.read_f32::<LittleEndian>()
}

// 基础整数类型写入函数
pub fn write_u8(writer: &mut dyn Write, value: u8) -> Result<(), std::io::Error> {
    writer.write_u8(value)
}

pub fn write_u16(writer: &mut dyn Write, value: u16) -> Result<(), std::io::Error> {
    writer.write_u16::<LittleEndian>(value)
}

pub fn write_u32(writer: &mut dyn Write, value: u32) -> Result<(), std::io::Error> {
    writer.write_u32::<LittleEndian>(value)
}

pub fn write_i32(writer: &mut dyn Write, value: i32) -> Result<(), std::io::Error> {
    writer.write_i32::<LittleEndian>(value)
}

pub fn write_f32(writer: &mut dyn Write, value: f32) -> Result<(), std::io::Error> {
    writer.write_f32::<LittleEndian>(value)
}

// 支持的编码
const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "windows-1252", "windows-1250", "windows-1251"];

/// 带编码信息的字符串
#[derive(Debug, Clone, PartialEq)]
pub struct RawString {
    pub content: String,
    pub encoding: String,
}

impl RawString {
    /// 尝试多种编码解码
    pub fn decode(data: &[u8]) -> Self {
        for encoding_name in SUPPORTED_ENCODINGS {
            if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_name.as_bytes()) {
                let (decoded, _, had_errors) = encoding.decode(data);
                if !had_errors {
                    return RawString {
                        content: decoded.into_owned(),
                        encoding: encoding_name.to_string(),
                    };
                }
            }
        }

        // 回退到UTF-8，忽略错误
        RawString {
            content: String::from_utf8_lossy(data).into_owned(),
            encoding: "utf-8".to_string(),
        }
    }

    /// Z字符串解析(以null结尾)
    pub fn parse_zstring(data: &[u8]) -> Self {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Self::decode(&data[..null_pos])
    }

    /// B字符串解析(长度前缀)
    pub fn parse_bstring(cursor: &mut Cursor<&[u8]>) -> Result<Self, std::io::Error> {
        let length = read_u8(cursor)? as usize;
        let mut buffer = vec![0u8; length];
        cursor.read_exact(&mut buffer)?;

        // 移除末尾的null字符
        if let Some(null_pos) = buffer.iter().position(|&b| b == 0) {
            buffer.truncate(null_pos);
        }

        Ok(Self::decode(&buffer))
    }
}

/// 编码Z字符串（UTF-8 + null终止符）
pub fn encode_zstring(text: &str) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    data.push(0);
    data
}

/// 4字符标签与字符串互转
pub fn tag_to_string(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

// 记录标志位定义（顶层记录与TES4头部共用同一标志字）
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        const MASTER_FILE = 0x00000001;        // ESM标志
        const DELETED = 0x00000020;            // 已删除
        const LOCALIZED = 0x00000080;          // 本地化（使用外部STRING表）
        const LIGHT_MASTER = 0x00000200;       // 轻量级主文件
        const PERSISTENT = 0x00000400;         // 持久化
        const DISABLED = 0x00000800;           // 禁用
        const IGNORED = 0x00001000;            // 忽略
        const VISIBLE_DISTANT = 0x00008000;    // 远距离可见
        const COMPRESSED = 0x00040000;         // 压缩
        const CANT_WAIT = 0x00080000;          // 不可等待
    }
}
