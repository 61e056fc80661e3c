//! 命令编解码。
//!
//! - [`decode_client_command`]: 把操作端发来的 `WireMessage` 解析并校验为 [`Command`]；
//! - [`encode_serial_frame`]: 把需要下发的命令编码为串口帧；
//! - [`decode_telemetry`]: 把下位机主动上报的帧解码为遥测主题和数据。

use crate::error::BridgeError;
use common_models::enums::{ArmState, Direction, TelemetryTopic};
use common_models::payloads::{self, ArmMovementPayload, EmptyPayload, FollowModePayload, MovePayload, RawFramePayload,
    RfidValidPayload, SubscriptionPayload, TelemetryData, ToolIdPayload, ToolNamePayload};
use rust_link_utils::frame::{frame_types, SerialFrame, MAX_FRAME_PAYLOAD};
use rust_link_utils::message::WireMessage;
use serde::de::DeserializeOwned;

/// 工具编号必须严格位于 0 和该值之间。
pub const MAX_TOOL_ID: u8 = 7;
/// 工具名称在帧中固定占 16 字节，不足部分以空格补齐。
pub const TOOL_NAME_LEN: usize = 16;
pub const MAX_SPEED: u8 = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Move { direction: Direction, speed: u8 },
    Stop,
    SetToolId { tool: u8 },
    SetToolName { name: String },
    FollowMode { enabled: bool },
    RfidValid { valid: bool },
    ArmMovement { state: ArmState },
    Subscribe { topic: TelemetryTopic },
    Unsubscribe { topic: TelemetryTopic },
    Ping,
    Status,
    RawPassthrough { frame_type: u8, data: Vec<u8> },
    /// 网关内部生成的保活帧，不能由操作端发送
    KeepAlive,
}

impl CommandKind {
    /// 是否需要下发到串口。`Subscribe`/`Unsubscribe`/`Ping`/`Status` 由网关本地应答。
    pub fn is_link_bound(&self) -> bool {
        !matches!(
            self,
            CommandKind::Subscribe { .. } | CommandKind::Unsubscribe { .. } | CommandKind::Ping | CommandKind::Status
        )
    }

    /// 对应的客户端消息类型，用于填写应答中的 `original_message_type`。
    pub fn message_type(&self) -> &'static str {
        match self {
            CommandKind::Move { .. } => payloads::MOVE_MESSAGE_TYPE,
            CommandKind::Stop => payloads::STOP_MESSAGE_TYPE,
            CommandKind::SetToolId { .. } => payloads::SET_TOOL_ID_MESSAGE_TYPE,
            CommandKind::SetToolName { .. } => payloads::SET_TOOL_NAME_MESSAGE_TYPE,
            CommandKind::FollowMode { .. } => payloads::FOLLOW_MODE_MESSAGE_TYPE,
            CommandKind::RfidValid { .. } => payloads::RFID_VALID_MESSAGE_TYPE,
            CommandKind::ArmMovement { .. } => payloads::ARM_MOVEMENT_MESSAGE_TYPE,
            CommandKind::Subscribe { .. } => payloads::SUBSCRIBE_MESSAGE_TYPE,
            CommandKind::Unsubscribe { .. } => payloads::UNSUBSCRIBE_MESSAGE_TYPE,
            CommandKind::Ping => payloads::PING_MESSAGE_TYPE,
            CommandKind::Status => payloads::STATUS_REQUEST_MESSAGE_TYPE,
            CommandKind::RawPassthrough { .. } => payloads::RAW_FRAME_MESSAGE_TYPE,
            CommandKind::KeepAlive => "KeepAlive",
        }
    }
}

/// 一条已解析的命令。解析后不再修改。
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub correlation_id: Option<u32>,
}

impl Command {
    pub fn new(kind: CommandKind, correlation_id: Option<u32>) -> Self {
        Command { kind, correlation_id }
    }
}

fn payload<T: DeserializeOwned>(message: &WireMessage) -> Result<T, BridgeError> {
    message
        .deserialize_payload::<T>()
        .map_err(|e| BridgeError::MalformedCommand(e.to_string()))
}

fn malformed(message: impl Into<String>) -> BridgeError {
    BridgeError::MalformedCommand(message.into())
}

/// 解析并校验一条操作端消息。
pub fn decode_client_command(message: &WireMessage) -> Result<Command, BridgeError> {
    let kind = match message.message_type.as_str() {
        payloads::MOVE_MESSAGE_TYPE => {
            let p: MovePayload = payload(message)?;
            if p.speed > MAX_SPEED {
                return Err(malformed(format!("速度超出范围 0..={}: {}", MAX_SPEED, p.speed)));
            }
            CommandKind::Move { direction: p.direction, speed: p.speed }
        }
        payloads::STOP_MESSAGE_TYPE => {
            let _: EmptyPayload = payload(message)?;
            CommandKind::Stop
        }
        payloads::SET_TOOL_ID_MESSAGE_TYPE => {
            let p: ToolIdPayload = payload(message)?;
            if p.tool == 0 || p.tool >= MAX_TOOL_ID {
                return Err(malformed(format!("工具编号超出范围 (0, {}): {}", MAX_TOOL_ID, p.tool)));
            }
            CommandKind::SetToolId { tool: p.tool }
        }
        payloads::SET_TOOL_NAME_MESSAGE_TYPE => {
            let p: ToolNamePayload = payload(message)?;
            if p.name.is_empty() || !p.name.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(malformed("工具名称只能包含字母和数字"));
            }
            if p.name.len() > TOOL_NAME_LEN {
                return Err(malformed(format!("工具名称超过 {} 个字符", TOOL_NAME_LEN)));
            }
            CommandKind::SetToolName { name: p.name }
        }
        payloads::FOLLOW_MODE_MESSAGE_TYPE => {
            let p: FollowModePayload = payload(message)?;
            CommandKind::FollowMode { enabled: p.enabled }
        }
        payloads::RFID_VALID_MESSAGE_TYPE => {
            let p: RfidValidPayload = payload(message)?;
            CommandKind::RfidValid { valid: p.valid }
        }
        payloads::ARM_MOVEMENT_MESSAGE_TYPE => {
            let p: ArmMovementPayload = payload(message)?;
            CommandKind::ArmMovement { state: p.state }
        }
        payloads::SUBSCRIBE_MESSAGE_TYPE => {
            let p: SubscriptionPayload = payload(message)?;
            CommandKind::Subscribe { topic: p.topic }
        }
        payloads::UNSUBSCRIBE_MESSAGE_TYPE => {
            let p: SubscriptionPayload = payload(message)?;
            CommandKind::Unsubscribe { topic: p.topic }
        }
        payloads::PING_MESSAGE_TYPE => CommandKind::Ping,
        payloads::STATUS_REQUEST_MESSAGE_TYPE => CommandKind::Status,
        payloads::RAW_FRAME_MESSAGE_TYPE => {
            let p: RawFramePayload = payload(message)?;
            if p.frame_type >= frame_types::HOST_BOUND_MIN {
                return Err(malformed(format!("原始帧类型 {:#04x} 保留给下位机上报", p.frame_type)));
            }
            if p.data.len() > MAX_FRAME_PAYLOAD {
                return Err(malformed(format!("原始帧负载超过 {} 字节", MAX_FRAME_PAYLOAD)));
            }
            CommandKind::RawPassthrough { frame_type: p.frame_type, data: p.data }
        }
        other => return Err(malformed(format!("未知的消息类型: '{}'", other))),
    };
    Ok(Command::new(kind, message.correlation_id))
}

/// 把需要下发的命令编码为串口帧。本地应答的命令返回 `MalformedCommand`。
pub fn encode_serial_frame(command: &Command, sequence: u16) -> Result<SerialFrame, BridgeError> {
    let (frame_type, data) = match &command.kind {
        CommandKind::Move { direction, speed } => (frame_types::MOVE, vec![direction.code(), *speed]),
        CommandKind::Stop => (frame_types::STOP, Vec::new()),
        CommandKind::SetToolId { tool } => (frame_types::TOOL_ID, vec![*tool]),
        CommandKind::SetToolName { name } => {
            let mut bytes = name.as_bytes().to_vec();
            bytes.resize(TOOL_NAME_LEN, b' ');
            (frame_types::TOOL_NAME, bytes)
        }
        CommandKind::FollowMode { enabled } => (frame_types::FOLLOW_MODE, vec![u8::from(*enabled)]),
        CommandKind::RfidValid { valid } => (frame_types::RFID_VALID, vec![u8::from(*valid)]),
        CommandKind::ArmMovement { state } => (frame_types::ARM_MOVEMENT, vec![state.code()]),
        CommandKind::RawPassthrough { frame_type, data } => (*frame_type, data.clone()),
        CommandKind::KeepAlive => (frame_types::KEEPALIVE, Vec::new()),
        local => {
            return Err(malformed(format!("{} 不需要下发到串口", local.message_type())));
        }
    };
    SerialFrame::new(frame_type, sequence, data).map_err(|e| malformed(e.to_string()))
}

/// 下位机上报帧类型到遥测主题的映射。
pub fn topic_for_frame_type(frame_type: u8) -> TelemetryTopic {
    match frame_type {
        frame_types::BATTERY => TelemetryTopic::Battery,
        frame_types::ARM_STATUS => TelemetryTopic::ArmStatus,
        frame_types::RFID => TelemetryTopic::Rfid,
        frame_types::KEEPALIVE_ECHO => TelemetryTopic::KeepAlive,
        _ => TelemetryTopic::Raw,
    }
}

fn raw(frame: &SerialFrame) -> (TelemetryTopic, TelemetryData) {
    (TelemetryTopic::Raw, TelemetryData::Raw { frame_type: frame.frame_type, data: frame.payload.clone() })
}

/// 解码遥测帧。负载长度与帧类型不符时按 `Raw` 处理。
pub fn decode_telemetry(frame: &SerialFrame) -> (TelemetryTopic, TelemetryData) {
    let topic = topic_for_frame_type(frame.frame_type);
    let data = match (topic, frame.payload.as_slice()) {
        (TelemetryTopic::Battery, [level]) => TelemetryData::Battery {
            raw: *level,
            percent: f32::from(*level) / 255.0 * 100.0,
        },
        (TelemetryTopic::ArmStatus, [code]) => TelemetryData::ArmStatus { raw: *code, state: ArmState::from_code(*code) },
        (TelemetryTopic::Rfid, bytes) if bytes.len() == 4 => TelemetryData::Rfid {
            tag: bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        },
        (TelemetryTopic::KeepAlive, _) => TelemetryData::KeepAlive,
        _ => return raw(frame),
    };
    (topic, data)
}
