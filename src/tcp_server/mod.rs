//! 面向操作端的 TCP 服务：会话、注册表、消息路由和心跳监视。

pub mod client_session;
pub mod connection_manager;
pub mod heartbeat_monitor;
pub mod message_router;
pub mod service;
