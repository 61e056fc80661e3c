//! 通用枚举模块。
//!
//! 本模块定义了网关各组件之间共享的通用枚举类型，确保运动方向、机械臂状态、
//! 遥测主题、链路状态等概念在整个系统中有一致的表示。
//!
//! 需要出现在串口帧里的枚举提供 `code()` / `from_code()`，其取值与下位机固件约定一致。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 移动指令的方向。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
}

impl Direction {
    /// 串口帧中的方向编码。
    pub fn code(self) -> u8 {
        match self {
            Direction::Forward => 0x01,
            Direction::Backward => 0x02,
            Direction::Left => 0x03,
            Direction::Right => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Direction::Forward),
            0x02 => Some(Direction::Backward),
            0x03 => Some(Direction::Left),
            0x04 => Some(Direction::Right),
            _ => None,
        }
    }
}

/// 机械臂状态。
///
/// 取值与 STM32 固件中的 `RPI_ARM_STATE` 一致，既用于下发机械臂动作，
/// 也用于解析下位机上报的机械臂状态帧。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArmState {
    Idle,
    Ready,
    Closed,
    Display,
}

impl ArmState {
    pub fn code(self) -> u8 {
        match self {
            ArmState::Idle => 0x01,
            ArmState::Ready => 0x02,
            ArmState::Closed => 0x04,
            ArmState::Display => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ArmState::Idle),
            0x02 => Some(ArmState::Ready),
            0x04 => Some(ArmState::Closed),
            0x08 => Some(ArmState::Display),
            _ => None,
        }
    }
}

/// 客户端可以订阅的遥测主题。
///
/// 下位机主动推送的（不带关联 ID 的）帧按帧类型映射到主题，
/// 网关只把帧扇出给订阅了对应主题的会话。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryTopic {
    /// 电池电量
    Battery,
    /// 机械臂状态
    ArmStatus,
    /// RFID 读卡结果
    Rfid,
    /// 下位机对保活帧的回显
    KeepAlive,
    /// 未识别类型的原始帧
    Raw,
}

impl fmt::Display for TelemetryTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 串口链路的状态机状态。
///
/// `Disconnected → Connecting → Ready → Draining → Closed`，
/// `Ready` 在读写失败时回到 `Disconnected` 并进入退避重连。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 返回给客户端的错误分类，随 `ErrorResponsePayload` 一起发送。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayErrorKind {
    /// 无法解析的命令或违反帧格式，发送后会话会被关闭
    MalformedCommand,
    /// 串口链路当前不可用，命令被立即拒绝
    LinkUnavailable,
    /// 命令已下发，但等待应答期间链路断开
    LinkDown,
    /// 写串口失败
    LinkWriteError,
    /// 在超时时间内未收到下位机应答
    CommandTimeout,
    /// 网关正在关闭，不再接受新命令
    ShuttingDown,
    /// 客户端长时间不读取，待发送的应答超过上限，发送后会话会被关闭
    OutboundOverflow,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    /// 方向与机械臂状态的编码应当可以互相还原。
    fn test_codes_are_reversible() {
        for direction in [Direction::Forward, Direction::Backward, Direction::Left, Direction::Right] {
            assert_eq!(Direction::from_code(direction.code()), Some(direction));
        }
        for state in [ArmState::Idle, ArmState::Ready, ArmState::Closed, ArmState::Display] {
            assert_eq!(ArmState::from_code(state.code()), Some(state));
        }
        assert_eq!(ArmState::from_code(0x03), None, "0x03 不是合法的机械臂状态编码");
        assert_eq!(Direction::from_code(0x00), None);
    }

    #[test]
    /// 测试 `TelemetryTopic` 的 JSON 表示为枚举成员名称字符串。
    fn test_topic_serialization() {
        let json = serde_json::to_string(&TelemetryTopic::ArmStatus).expect("序列化 TelemetryTopic 失败");
        assert_eq!(json, "\"ArmStatus\"");
        let topic: TelemetryTopic = serde_json::from_str("\"Battery\"").expect("反序列化 TelemetryTopic 失败");
        assert_eq!(topic, TelemetryTopic::Battery);
    }

    #[test]
    /// `TelemetryTopic` 可以作为 `HashSet` 元素使用（订阅集合依赖这一点）。
    fn test_topic_hash() {
        let mut topics = HashSet::new();
        topics.insert(TelemetryTopic::Battery);
        topics.insert(TelemetryTopic::Battery);
        topics.insert(TelemetryTopic::Rfid);
        assert_eq!(topics.len(), 2);
        assert!(!topics.contains(&TelemetryTopic::Raw));
    }

    #[test]
    fn test_display_uses_variant_name() {
        assert_eq!(LinkState::Draining.to_string(), "Draining");
        assert_eq!(GatewayErrorKind::CommandTimeout.to_string(), "CommandTimeout");
    }
}
