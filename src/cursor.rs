use crate::datatypes::RawString;
use crate::utils::EspError;
use byteorder::{ByteOrder, LittleEndian};

/// 记录载荷游标
///
/// 覆盖一段固定大小的字节区域的消耗式读取器。容器解析依赖 `is_done()`
/// 判断何时停止请求字段：一个容器必须恰好消耗完其声明长度，读取越界
/// 立即报 MalformedRecord；少消耗仅对显式声明的"可选尾字段"槽位容忍，
/// 由调用方（Scalar 解析）负责判定。
pub struct RecordCursor<'a> {
    data: &'a [u8],
    pos: usize,
    /// 错误上下文（通常为记录类型）
    label: String,
}

impl<'a> RecordCursor<'a> {
    pub fn new(data: &'a [u8], label: impl Into<String>) -> Self {
        RecordCursor {
            data,
            pos: 0,
            label: label.into(),
        }
    }

    /// 剩余未消耗字节数
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// 是否已消耗完声明长度
    pub fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// 当前位置
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EspError> {
        if self.pos + n > self.data.len() {
            return Err(EspError::malformed(
                self.label.clone(),
                format!(
                    "cursor overrun: need {} bytes at offset {}, {} remaining",
                    n,
                    self.pos,
                    self.remaining()
                ),
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// 窥视下一个4字符标签（不移动游标）
    pub fn peek_tag(&self) -> Option<[u8; 4]> {
        if self.remaining() < 4 {
            return None;
        }
        let s = &self.data[self.pos..self.pos + 4];
        Some([s[0], s[1], s[2], s[3]])
    }

    /// 提取4字符标签
    pub fn extract_tag(&mut self) -> Result<[u8; 4], EspError> {
        let slice = self.take(4)?;
        Ok([slice[0], slice[1], slice[2], slice[3]])
    }

    pub fn extract_u8(&mut self) -> Result<u8, EspError> {
        Ok(self.take(1)?[0])
    }

    pub fn extract_i8(&mut self) -> Result<i8, EspError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn extract_u16(&mut self) -> Result<u16, EspError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn extract_i16(&mut self) -> Result<i16, EspError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn extract_u32(&mut self) -> Result<u32, EspError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn extract_i32(&mut self) -> Result<i32, EspError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn extract_f32(&mut self) -> Result<f32, EspError> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    /// 按声明宽度提取长度字段（1/2/4字节）
    pub fn extract_length(&mut self, width: usize) -> Result<u32, EspError> {
        match width {
            1 => Ok(self.extract_u8()? as u32),
            2 => Ok(self.extract_u16()? as u32),
            4 => self.extract_u32(),
            _ => Err(EspError::malformed(
                self.label.clone(),
                format!("unsupported length field width: {}", width),
            )),
        }
    }

    pub fn extract_bytes(&mut self, n: usize) -> Result<&'a [u8], EspError> {
        self.take(n)
    }

    /// 提取剩余全部字节
    pub fn extract_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// 提取Z字符串（消耗到null终止符，无终止符则消耗到区域末尾）
    pub fn extract_zstring(&mut self) -> RawString {
        let rest = &self.data[self.pos..];
        let null_pos = rest.iter().position(|&b| b == 0);
        match null_pos {
            Some(p) => {
                let s = RawString::decode(&rest[..p]);
                self.pos += p + 1; // 连同终止符一起消耗
                s
            }
            None => {
                let s = RawString::decode(rest);
                self.pos = self.data.len();
                s
            }
        }
    }

    /// 声明长度已消耗完毕的断言，多余字节报 MalformedRecord
    pub fn expect_done(&self) -> Result<(), EspError> {
        if !self.is_done() {
            return Err(EspError::malformed(
                self.label.clone(),
                format!("{} unconsumed trailing bytes in payload", self.remaining()),
            ));
        }
        Ok(())
    }
}
