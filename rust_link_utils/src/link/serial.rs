// rust_link_utils/src/link/serial.rs

//! 基于 `serialport` 的 UART 链路。

use super::{LinkHandle, LinkOpener, StreamFrameReader, StreamFrameWriter};
use crate::error::LinkUtilError;
use log::info;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::time::Duration;

/// 串口打开参数：8N1，无流控。
#[derive(Debug, Clone)]
pub struct SerialLinkOpener {
    pub device_path: String,
    pub baud_rate: u32,
    /// 读超时。读线程每隔这么久至少醒来一次检查停止标志。
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl SerialLinkOpener {
    pub fn new(device_path: impl Into<String>, baud_rate: u32, read_timeout: Duration, write_timeout: Duration) -> Self {
        SerialLinkOpener { device_path: device_path.into(), baud_rate, read_timeout, write_timeout }
    }
}

impl LinkOpener for SerialLinkOpener {
    fn open(&self) -> Result<LinkHandle, LinkUtilError> {
        let port = serialport::new(&self.device_path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| LinkUtilError::LinkUnavailable(format!("{}: {}", self.device_path, e)))?;

        // 写端是同一设备的独立句柄，超时单独设置
        let mut write_port = port
            .try_clone()
            .map_err(|e| LinkUtilError::LinkUnavailable(format!("无法复制串口句柄 {}: {}", self.device_path, e)))?;
        write_port
            .set_timeout(self.write_timeout)
            .map_err(|e| LinkUtilError::LinkUnavailable(format!("无法设置写超时 {}: {}", self.device_path, e)))?;

        info!("[SerialLink] 已打开串口 {} ({} baud, 8N1)", self.device_path, self.baud_rate);

        Ok(LinkHandle {
            reader: Box::new(StreamFrameReader::new(port)),
            writer: Box::new(StreamFrameWriter::new(write_port)),
            description: self.describe(),
        })
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.device_path, self.baud_rate)
    }
}
