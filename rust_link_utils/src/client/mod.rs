// rust_link_utils/src/client/mod.rs

//! TCP 客户端模块。
//!
//! 提供一个最小的操作端连接 [`transport::ClientConnection`]，
//! 用于集成测试以及调试工具向网关发送命令、接收应答和遥测。

pub mod transport;
