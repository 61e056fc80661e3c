//! `common_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了机器人网关 (`robot_gateway`)、链路工具库 (`rust_link_utils`)
//! 以及远程操作端之间共享的数据结构和枚举类型。
//!
//! 主要包含以下类型的模型：
//! - **通用枚举 (`enums`)**: 运动方向、机械臂状态、遥测主题、串口链路状态、错误分类等。
//! - **客户端消息负载 (`payloads`)**: 操作端与网关之间通过 TCP 通信时传输的各类 Payload 结构体，
//!   以及对应的消息类型常量。
//!
//! 设计原则：
//! - 所有模型都派生 `serde::Serialize` 和 `serde::Deserialize`，以 JSON 形式在网络上传输。
//! - 所有模型也派生 `Debug` 和 `Clone`，方便调试输出和创建副本。

pub mod enums; // 项目中通用的枚举类型定义
pub mod payloads; // 操作端 <-> 网关 消息负载结构体
