// rust_link_utils/src/server/mod.rs

//! 服务端 TCP 传输模块。
//!
//! `transport` 子模块提供 [`transport::ServerTransport`]：绑定监听地址并为每个接入的连接
//! 派生一个独立的 Tokio 任务，连接上的分帧收发由 [`crate::message`] 中的辅助函数完成。

pub mod transport;
