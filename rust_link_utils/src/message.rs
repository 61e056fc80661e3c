// rust_link_utils/src/message.rs

//! 操作端与网关之间 TCP 通信使用的消息信封及流式分帧。
//!
//! TCP 是字节流，本模块在其上定义了最简单的分帧方式：
//! 每条消息为 `u32` 大端长度前缀 + UTF-8 JSON 消息体，消息体是一个序列化后的 [`WireMessage`]。
//!
//! - [`WireMessage`]: 消息信封，`payload` 字段是对应业务结构体的 JSON 字符串。
//! - [`ClientFrameDecoder`]: 可跨多次读取恢复的分帧解码器。
//! - [`send_message`] / [`receive_message`]: 基于 tokio `AsyncWrite` / `AsyncRead` 的收发辅助函数，
//!   服务端会话和测试客户端共用。

use crate::error::LinkUtilError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// 单条客户端消息体的最大长度 (64 KiB)。
pub const MAX_CLIENT_FRAME_LEN: usize = 64 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;

/// `WireMessage` 代表在操作端与网关之间交换的标准消息结构。
///
/// # 字段
/// - `message_id`: UUID v4 字符串，用于追踪和区分每一条消息。
/// - `message_type`: 业务类型 (例如 "Move", "Telemetry")，接收方据此解释 `payload`。
/// - `correlation_id`: 可选的关联 ID。客户端在命令上携带它，网关在对应的应答/错误上原样带回。
/// - `payload`: JSON 格式的业务数据字符串。
/// - `timestamp`: 创建时的 UTC 毫秒时间戳。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireMessage {
    pub message_id: String,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u32>,
    pub payload: String,
    pub timestamp: i64,
}

impl WireMessage {
    /// 创建一个新的 `WireMessage`，`payload_data` 会被序列化为 JSON 字符串。
    pub fn new<T: Serialize>(message_type: impl Into<String>, payload_data: &T) -> Result<WireMessage, LinkUtilError> {
        let payload_str = serde_json::to_string(payload_data)
            .map_err(|e| LinkUtilError::SerializationError(format!("创建 WireMessage 时序列化载荷失败: {}", e)))?;
        Ok(WireMessage {
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            correlation_id: None,
            payload: payload_str,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// 设置关联 ID (链式调用)。
    pub fn with_correlation_id(mut self, correlation_id: Option<u32>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// 将 `payload` 反序列化为目标类型 `T`。
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, LinkUtilError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            LinkUtilError::DeserializationError(format!(
                "将载荷反序列化为目标类型失败 (message_type: '{}'): {}",
                self.message_type, e
            ))
        })
    }

    /// 从一帧消息体 (JSON 字节) 解析出消息信封。
    pub fn from_json_bytes(body: &[u8]) -> Result<WireMessage, LinkUtilError> {
        serde_json::from_slice(body)
            .map_err(|e| LinkUtilError::DeserializationError(format!("无法解析消息信封: {}", e)))
    }

    /// 序列化为带长度前缀的完整帧。
    pub fn to_frame(&self) -> Result<Vec<u8>, LinkUtilError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| LinkUtilError::SerializationError(format!("序列化 WireMessage 失败: {}", e)))?;
        encode_client_frame(&body)
    }
}

/// 为消息体加上 4 字节大端长度前缀。
pub fn encode_client_frame(body: &[u8]) -> Result<Vec<u8>, LinkUtilError> {
    if body.len() > MAX_CLIENT_FRAME_LEN {
        return Err(LinkUtilError::MalformedFrame(format!(
            "消息体长度 {} 超过上限 {}",
            body.len(),
            MAX_CLIENT_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// 长度前缀分帧的增量解码器。
///
/// 读到的字节通过 [`extend`](Self::extend) 追加进来，
/// 每次调用 [`next_frame`](Self::next_frame) 最多取出一条完整的消息体。
#[derive(Debug)]
pub struct ClientFrameDecoder {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for ClientFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_CLIENT_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        ClientFrameDecoder { buffer: Vec::new(), max_len }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 已缓存但尚未组成完整帧的字节数。
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 取出下一条完整的消息体。
    ///
    /// - `Ok(Some(body))`: 一条完整消息；
    /// - `Ok(None)`: 数据不足，需要继续读取；
    /// - `Err(MalformedFrame)`: 声明的长度超过上限，连接应当被终止。
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, LinkUtilError> {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if declared > self.max_len {
            return Err(LinkUtilError::MalformedFrame(format!(
                "声明的消息体长度 {} 超过上限 {}",
                declared, self.max_len
            )));
        }
        let total = LENGTH_PREFIX_LEN + declared;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let body = self.buffer[LENGTH_PREFIX_LEN..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(body))
    }
}

/// 发送一条消息并刷新写端。
pub async fn send_message<W>(writer: &mut W, message: &WireMessage) -> Result<(), LinkUtilError>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.to_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// 从读端接收下一条消息。
///
/// 返回 `None` 表示对端在帧边界上正常关闭了连接。
/// 本函数可以安全地放在 `tokio::select!` 中被取消：已读到的字节总是先交给 `decoder` 保存。
pub async fn receive_message<R>(
    reader: &mut R,
    decoder: &mut ClientFrameDecoder,
) -> Option<Result<WireMessage, LinkUtilError>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match decoder.next_frame() {
            Ok(Some(body)) => return Some(WireMessage::from_json_bytes(&body)),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                if decoder.buffered_len() > 0 {
                    return Some(Err(LinkUtilError::TruncatedFrame { buffered: decoder.buffered_len() }));
                }
                return None;
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => return Some(Err(LinkUtilError::IoError(e))),
        }
    }
}
