use common_models::enums::GatewayErrorKind;
use thiserror::Error;

/// 应用的主要错误类型
///
/// 进程级别的失败 (配置、监听、热点、串口启动)，在 `main` 中转换为非零退出码。
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("TCP 服务错误: {0}")]
    TcpService(String),

    #[error("串口链路错误: {0}")]
    SerialLink(String),

    #[error("热点错误: {0}")]
    Hotspot(#[from] crate::hotspot::ApError),
}

/// 单条命令在桥接过程中的失败原因，最终以 `ErrorResponse` 的形式回给发起的会话。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("命令格式错误: {0}")]
    MalformedCommand(String),

    #[error("串口链路当前不可用")]
    LinkUnavailable,

    #[error("等待应答期间串口链路断开")]
    LinkDown,

    #[error("写串口失败: {0}")]
    LinkWriteError(String),

    #[error("等待下位机应答超时 ({0} ms)")]
    CommandTimeout(u64),

    #[error("网关正在关闭，不再接受命令")]
    ShuttingDown,

    #[error("待发送的应答超过上限 ({0} 条)，关闭会话")]
    OutboundOverflow(usize),
}

impl BridgeError {
    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            BridgeError::MalformedCommand(_) => GatewayErrorKind::MalformedCommand,
            BridgeError::LinkUnavailable => GatewayErrorKind::LinkUnavailable,
            BridgeError::LinkDown => GatewayErrorKind::LinkDown,
            BridgeError::LinkWriteError(_) => GatewayErrorKind::LinkWriteError,
            BridgeError::CommandTimeout(_) => GatewayErrorKind::CommandTimeout,
            BridgeError::ShuttingDown => GatewayErrorKind::ShuttingDown,
            BridgeError::OutboundOverflow(_) => GatewayErrorKind::OutboundOverflow,
        }
    }
}
