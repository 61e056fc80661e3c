//! 串口桥接：命令编解码、待应答表、重连退避与调度器。

pub mod backoff;
pub mod codec;
pub mod dispatcher;
pub mod pending;
