//! `rust_link_utils` 是机器人网关使用的链路工具库。
//!
//! 它封装了网关两侧的传输细节，使上层只需处理结构化的消息和帧：
//!
//! - `message`: 操作端消息信封 `WireMessage`，以及长度前缀分帧的编解码。
//! - `frame`: 与下位机之间的串口帧格式、CRC 校验和增量解码器。
//! - `link`: 串口链路的能力接口 (`LinkOpener` / `FrameReader` / `FrameWriter`)，
//!   以及基于 `serialport` 的实现和测试用的内存假设备。
//! - `server`: TCP 监听与连接接受循环。
//! - `client`: 用于测试和调试的 TCP 客户端。
//! - `error`: 统一错误类型 `LinkUtilError`。

pub mod client;
pub mod error;
pub mod frame;
pub mod link;
pub mod message;
pub mod server;
