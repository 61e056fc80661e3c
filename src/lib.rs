//! `robot_gateway` 网关核心库。
//!
//! 机器人端控制网关：接受操作端的 TCP 连接，把命令转换为串口帧发给下位机 (STM32)，
//! 并把下位机的应答和遥测回送给对应的操作端。
//!
//! 主要模块包括：
//! - `config`: 配置文件的加载、校验与默认值。
//! - `error`: 进程级错误 `AppError` 与单条命令的失败原因 `BridgeError`。
//! - `bridge`: 命令编解码、待应答表、重连退避和独占串口的桥接调度器。
//! - `tcp_server`: 会话、会话注册表、消息路由、心跳监视和 TCP 服务。
//! - `hotspot`: Wi-Fi 热点 (hostapd / dnsmasq) 的启动、监视与关闭。

pub mod bridge;
pub mod config;
pub mod error;
pub mod hotspot;
pub mod tcp_server;
