// rust_link_utils/src/error.rs

//! 定义链路工具库相关的错误类型。

use thiserror::Error;

/// 链路工具库的统一错误类型。
///
/// 同时覆盖两侧的传输：
/// - 面向操作端的 TCP 连接 (绑定、收发、长度前缀帧、JSON 信封)；
/// - 面向下位机的串口链路 (打开、读写、帧校验)。
#[derive(Error, Debug)]
pub enum LinkUtilError {
    /// 当 TCP 监听器无法绑定到指定地址时发生。
    #[error("TCP 监听器绑定错误: {0}")]
    TcpBindError(#[source] std::io::Error),

    /// 当 serde 序列化失败时返回。
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 当 serde 反序列化失败时返回。
    #[error("反序列化错误: {0}")]
    DeserializationError(String),

    /// 客户端帧违反了长度前缀协议 (例如声明长度超过上限)。
    #[error("客户端帧格式错误: {0}")]
    MalformedFrame(String),

    /// 对端在一帧尚未接收完整时关闭了连接。
    #[error("连接在帧中途关闭 (已缓存 {buffered} 字节)")]
    TruncatedFrame { buffered: usize },

    /// 底层 I/O 错误。
    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 串口设备无法打开。
    #[error("串口链路不可用: {0}")]
    LinkUnavailable(String),

    /// 写串口失败或写超时。
    #[error("串口写入失败: {0}")]
    LinkWriteError(String),

    /// 读串口失败 (设备拔出、句柄失效等)。
    #[error("串口读取失败: {0}")]
    LinkReadError(String),

    /// 收到的串口帧校验失败或头部非法，已丢弃。
    #[error("串口帧损坏: {0}")]
    FrameCorrupt(String),

    /// 待编码的串口帧负载超过上限。
    #[error("串口帧负载过长: {len} 字节 (上限 {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// 未连接错误，当尝试在未建立连接时进行操作。
    #[error("未连接")]
    NotConnected,
}
