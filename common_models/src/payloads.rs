//! 操作端与网关之间 TCP 通信使用的各种 Payload 结构体定义。
//!
//! 每条消息的外层信封是 `rust_link_utils::message::WireMessage`，其中 `message_type`
//! 取本模块定义的常量，`payload` 是对应结构体的 JSON 字符串。
//! 关联 ID 由信封携带，这里的结构体不重复包含。

use crate::enums::{ArmState, Direction, GatewayErrorKind, LinkState, TelemetryTopic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 操作端 -> 网关
// ---------------------------------------------------------------------------

pub const MOVE_MESSAGE_TYPE: &str = "Move";
pub const STOP_MESSAGE_TYPE: &str = "Stop";
pub const SET_TOOL_ID_MESSAGE_TYPE: &str = "SetToolId";
pub const SET_TOOL_NAME_MESSAGE_TYPE: &str = "SetToolName";
pub const FOLLOW_MODE_MESSAGE_TYPE: &str = "FollowMode";
pub const RFID_VALID_MESSAGE_TYPE: &str = "RfidValid";
pub const ARM_MOVEMENT_MESSAGE_TYPE: &str = "ArmMovement";
pub const SUBSCRIBE_MESSAGE_TYPE: &str = "Subscribe";
pub const UNSUBSCRIBE_MESSAGE_TYPE: &str = "Unsubscribe";
pub const PING_MESSAGE_TYPE: &str = "Ping";
pub const STATUS_REQUEST_MESSAGE_TYPE: &str = "StatusRequest";
pub const RAW_FRAME_MESSAGE_TYPE: &str = "Raw";

// ---------------------------------------------------------------------------
// 网关 -> 操作端
// ---------------------------------------------------------------------------

pub const WELCOME_MESSAGE_TYPE: &str = "Welcome";
pub const ACK_MESSAGE_TYPE: &str = "Ack";
pub const TELEMETRY_MESSAGE_TYPE: &str = "Telemetry";
pub const LINK_STATUS_MESSAGE_TYPE: &str = "LinkStatus";
pub const PONG_MESSAGE_TYPE: &str = "Pong";
pub const STATUS_MESSAGE_TYPE: &str = "Status";
pub const ERROR_RESPONSE_MESSAGE_TYPE: &str = "ErrorResponse";

/// 移动指令。`speed` 为 0..=100 的百分比。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MovePayload {
    pub direction: Direction,
    pub speed: u8,
}

/// 不携带任何数据的消息（`Stop`、`Ping`、`StatusRequest` 等）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct EmptyPayload {}

/// 选择工具编号，合法范围 1..=6。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolIdPayload {
    pub tool: u8,
}

/// 设置屏幕上显示的工具名称，仅允许字母和数字，最长 16 个字符。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolNamePayload {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FollowModePayload {
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RfidValidPayload {
    pub valid: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArmMovementPayload {
    pub state: ArmState,
}

/// `Subscribe` / `Unsubscribe` 共用。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubscriptionPayload {
    pub topic: TelemetryTopic,
}

/// 透传给下位机的原始帧，`frame_type` 必须小于 0x80（0x80 以上保留给上行帧）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawFramePayload {
    pub frame_type: u8,
    pub data: Vec<u8>,
}

/// 连接建立后网关发送的第一条消息。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WelcomePayload {
    pub session_id: Uuid,
    pub server_version: String,
    pub link_state: LinkState,
}

/// 命令确认。
///
/// - 对需要下位机应答的命令：`sequence` 为下发帧的序列号，`accepted`/`code` 来自 ACK/NACK 帧。
/// - 对网关本地处理的命令（订阅/退订）：`sequence` 为 `None`。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AckPayload {
    pub original_message_type: Option<String>,
    pub sequence: Option<u16>,
    pub accepted: bool,
    pub code: Option<u8>,
}

/// 下位机推送的遥测数据，已按帧类型解码。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind")]
pub enum TelemetryData {
    /// `raw` 为 0..=255 的原始值，`percent` 为换算后的百分比
    Battery { raw: u8, percent: f32 },
    /// `state` 为 `None` 表示下位机上报了未知的状态编码
    ArmStatus { raw: u8, state: Option<ArmState> },
    /// 小写十六进制表示的标签 UID
    Rfid { tag: String },
    KeepAlive,
    Raw { frame_type: u8, data: Vec<u8> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    pub topic: TelemetryTopic,
    pub sequence: u16,
    pub received_at: DateTime<Utc>,
    pub data: TelemetryData,
}

/// 串口链路状态变化通知，推送给所有会话。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LinkStatusPayload {
    pub state: LinkState,
    pub detail: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HotspotStatusPayload {
    pub up: bool,
    pub ssid: String,
    pub client_count: usize,
}

/// `StatusRequest` 的应答。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusPayload {
    pub link_state: LinkState,
    pub session_count: usize,
    pub pending_commands: usize,
    pub hotspot: Option<HotspotStatusPayload>,
    pub uptime_seconds: u64,
}

/// 标准错误响应。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponsePayload {
    pub original_message_type: Option<String>,
    pub kind: GatewayErrorKind,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_payload_json_shape() {
        let payload = MovePayload { direction: Direction::Forward, speed: 5 };
        let json = serde_json::to_string(&payload).expect("MovePayload 序列化失败");
        assert_eq!(json, r#"{"direction":"Forward","speed":5}"#);
        let back: MovePayload = serde_json::from_str(&json).expect("MovePayload 反序列化失败");
        assert_eq!(back, payload);
    }

    #[test]
    /// 遥测数据以 `kind` 字段区分变体。
    fn test_telemetry_data_is_internally_tagged() {
        let data = TelemetryData::Rfid { tag: "0a1b2c3d".to_string() };
        let json = serde_json::to_value(&data).expect("TelemetryData 序列化失败");
        assert_eq!(json["kind"], "Rfid");
        assert_eq!(json["tag"], "0a1b2c3d");

        let keep_alive: TelemetryData = serde_json::from_str(r#"{"kind":"KeepAlive"}"#).expect("反序列化 KeepAlive 失败");
        assert_eq!(keep_alive, TelemetryData::KeepAlive);
    }

    #[test]
    fn test_empty_payload_accepts_empty_object() {
        let parsed: EmptyPayload = serde_json::from_str("{}").expect("空对象应当可以解析为 EmptyPayload");
        assert_eq!(parsed, EmptyPayload::default());
    }
}
