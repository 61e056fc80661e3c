// rust_link_utils/src/frame.rs

//! 网关与下位机 (STM32) 之间的串口帧格式。
//!
//! ```text
//! +------+-----------+------+-----------+-----------------+-------------+
//! | 0x8A | len u16BE | type | seq u16BE | payload (len B) | crc16 u16BE |
//! +------+-----------+------+-----------+-----------------+-------------+
//! ```
//!
//! 校验和为 CRC-16/CCITT-FALSE，覆盖起始字节之后、校验和之前的全部字节 (长度、类型、序列号、负载)。
//! 负载最长 [`MAX_FRAME_PAYLOAD`] 字节。
//!
//! 解码器 [`FrameDecoder`] 是增量式的：字节可以分多次喂入；
//! 校验失败时只跳过当前起始字节并在后续数据中重新寻找起始字节。

use crate::error::LinkUtilError;

/// 帧起始字节 (沿用原有下位机协议的 START 标记)
pub const START_BYTE: u8 = 0x8A;
/// 起始字节 + 长度 + 类型 + 序列号
pub const HEADER_LEN: usize = 6;
pub const CHECKSUM_LEN: usize = 2;
pub const MAX_FRAME_PAYLOAD: usize = 255;

/// 帧类型编码。小于 0x80 的发往下位机，0x80 及以上由下位机发出。
pub mod frame_types {
    pub const TOOL_ID: u8 = 0x01;
    pub const TOOL_NAME: u8 = 0x02;
    pub const FOLLOW_MODE: u8 = 0x04;
    pub const RFID_VALID: u8 = 0x08;
    pub const MOVE: u8 = 0x10;
    pub const STOP: u8 = 0x11;
    pub const ARM_MOVEMENT: u8 = 0x12;
    pub const KEEPALIVE: u8 = 0x20;

    pub const HOST_BOUND_MIN: u8 = 0x80;
    pub const BATTERY: u8 = 0x81;
    pub const ARM_STATUS: u8 = 0x82;
    pub const RFID: u8 = 0x84;
    pub const KEEPALIVE_ECHO: u8 = 0x88;
    /// 负载: 被确认的序列号 (u16 BE)
    pub const ACK: u8 = 0xA0;
    /// 负载: 被拒绝的序列号 (u16 BE) + 错误码 (u8)
    pub const NACK: u8 = 0xA1;
}

/// 一帧串口数据。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub frame_type: u8,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl SerialFrame {
    pub fn new(frame_type: u8, sequence: u16, payload: Vec<u8>) -> Result<Self, LinkUtilError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(LinkUtilError::PayloadTooLarge { len: payload.len(), max: MAX_FRAME_PAYLOAD });
        }
        Ok(SerialFrame { frame_type, sequence, payload })
    }

    pub fn encode(&self) -> Result<Vec<u8>, LinkUtilError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(LinkUtilError::PayloadTooLarge { len: self.payload.len(), max: MAX_FRAME_PAYLOAD });
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        bytes.push(START_BYTE);
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.push(self.frame_type);
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        let crc = crc16_ccitt(&bytes[1..]);
        bytes.extend_from_slice(&crc.to_be_bytes());
        Ok(bytes)
    }

    /// 是否为下位机的 ACK/NACK 帧。
    pub fn is_acknowledgement(&self) -> bool {
        self.frame_type == frame_types::ACK || self.frame_type == frame_types::NACK
    }

    /// ACK/NACK 帧所确认的序列号。负载过短时返回 `None`。
    pub fn acked_sequence(&self) -> Option<u16> {
        if !self.is_acknowledgement() || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// NACK 帧的错误码。
    pub fn nack_code(&self) -> Option<u8> {
        if self.frame_type != frame_types::NACK {
            return None;
        }
        self.payload.get(2).copied()
    }
}

/// CRC-16/CCITT-FALSE (多项式 0x1021，初值 0xFFFF，不反转，无异或输出)。
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// 串口帧的增量解码器。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    discarded_bytes: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 起始字节之前被丢弃的噪声字节总数。
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 尝试从缓冲区解出一帧。
    ///
    /// - `Ok(Some(frame))`: 一帧完整且校验通过的数据；
    /// - `Ok(None)`: 数据不足；
    /// - `Err(FrameCorrupt)`: 当前候选帧损坏，已跳过其起始字节，调用方可以继续调用本方法。
    pub fn decode(&mut self) -> Result<Option<SerialFrame>, LinkUtilError> {
        match self.buffer.iter().position(|&b| b == START_BYTE) {
            None => {
                self.discarded_bytes += self.buffer.len() as u64;
                self.buffer.clear();
                return Ok(None);
            }
            Some(0) => {}
            Some(pos) => {
                self.discarded_bytes += pos as u64;
                self.buffer.drain(..pos);
            }
        }

        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            self.buffer.drain(..1);
            return Err(LinkUtilError::FrameCorrupt(format!("声明的负载长度 {} 超过上限", len)));
        }
        let total = HEADER_LEN + len + CHECKSUM_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let expected = u16::from_be_bytes([self.buffer[total - 2], self.buffer[total - 1]]);
        let actual = crc16_ccitt(&self.buffer[1..total - CHECKSUM_LEN]);
        if expected != actual {
            self.buffer.drain(..1);
            return Err(LinkUtilError::FrameCorrupt(format!(
                "校验和不匹配: 帧内 {:#06x}，计算值 {:#06x}",
                expected, actual
            )));
        }

        let frame = SerialFrame {
            frame_type: self.buffer[3],
            sequence: u16::from_be_bytes([self.buffer[4], self.buffer[5]]),
            payload: self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec(),
        };
        self.buffer.drain(..total);
        Ok(Some(frame))
    }
}
