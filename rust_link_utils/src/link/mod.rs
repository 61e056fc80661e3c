// rust_link_utils/src/link/mod.rs

//! 串口链路抽象。
//!
//! 网关只通过这里的三个能力接口接触串口：
//! - [`LinkOpener`]: 打开 (或重新打开) 链路，得到一个 [`LinkHandle`]；
//! - [`FrameReader`]: 阻塞读取下一帧，读超时返回 `Ok(None)`，便于读线程检查停止标志；
//! - [`FrameWriter`]: 阻塞写出一帧。
//!
//! 读写两半相互独立，由不同的线程持有：始终只有一个线程读、一个线程写。
//! 所有调用都是阻塞的，调用方应在 `spawn_blocking` 或专用线程中使用。
//!
//! 实现：
//! - [`serial::SerialLinkOpener`]: 基于 `serialport` 的真实 UART；
//! - [`memory::MemoryLink`]: 内存中的假设备，用于测试拔插、写失败和下位机应答。

pub mod memory;
pub mod serial;

use crate::error::LinkUtilError;
use crate::frame::{FrameDecoder, SerialFrame};
use log::trace;
use std::io::{ErrorKind, Read, Write};

pub trait FrameReader: Send {
    /// 读取下一帧。
    ///
    /// - `Ok(Some(frame))`: 收到一帧；
    /// - `Ok(None)`: 读超时，暂无数据；
    /// - `Err(FrameCorrupt)`: 丢弃了一帧损坏的数据，链路仍然可用；
    /// - `Err(LinkReadError)`: 链路已失效。
    fn read_frame(&mut self) -> Result<Option<SerialFrame>, LinkUtilError>;
}

pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: &SerialFrame) -> Result<(), LinkUtilError>;
}

/// 一次成功打开得到的链路句柄。
pub struct LinkHandle {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    /// 用于日志的描述，例如设备路径
    pub description: String,
}

pub trait LinkOpener: Send + Sync + 'static {
    fn open(&self) -> Result<LinkHandle, LinkUtilError>;

    fn describe(&self) -> String;
}

/// 把任意 `std::io::Read` 字节流包装为 [`FrameReader`]。
pub struct StreamFrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: Read + Send> StreamFrameReader<R> {
    pub fn new(inner: R) -> Self {
        StreamFrameReader { inner, decoder: FrameDecoder::new(), buf: vec![0u8; 512] }
    }
}

impl<R: Read + Send> FrameReader for StreamFrameReader<R> {
    fn read_frame(&mut self) -> Result<Option<SerialFrame>, LinkUtilError> {
        // 先处理缓冲区中已有的完整帧
        if let Some(frame) = self.decoder.decode()? {
            return Ok(Some(frame));
        }
        match self.inner.read(&mut self.buf) {
            Ok(0) => Err(LinkUtilError::LinkReadError("设备返回 EOF".to_string())),
            Ok(n) => {
                trace!("[SerialLink] 读取 {} 字节", n);
                self.decoder.extend(&self.buf[..n]);
                self.decoder.decode()
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(LinkUtilError::LinkReadError(e.to_string())),
        }
    }
}

/// 把任意 `std::io::Write` 字节流包装为 [`FrameWriter`]。
pub struct StreamFrameWriter<W> {
    inner: W,
}

impl<W: Write + Send> StreamFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        StreamFrameWriter { inner }
    }
}

impl<W: Write + Send> FrameWriter for StreamFrameWriter<W> {
    fn write_frame(&mut self, frame: &SerialFrame) -> Result<(), LinkUtilError> {
        let bytes = frame.encode()?;
        self.inner
            .write_all(&bytes)
            .and_then(|_| self.inner.flush())
            .map_err(|e| match e.kind() {
                ErrorKind::TimedOut => LinkUtilError::LinkWriteError("写超时".to_string()),
                _ => LinkUtilError::LinkWriteError(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_types;
    use std::io::Cursor;

    #[test]
    fn test_stream_reader_decodes_frames_from_bytes() {
        let first = SerialFrame::new(frame_types::BATTERY, 1, vec![128]).expect("合法帧");
        let second = SerialFrame::new(frame_types::KEEPALIVE_ECHO, 2, vec![]).expect("合法帧");
        let mut bytes = first.encode().expect("编码失败");
        bytes.extend(second.encode().expect("编码失败"));

        let mut reader = StreamFrameReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_frame().expect("读取失败"), Some(first));
        assert_eq!(reader.read_frame().expect("读取失败"), Some(second));
        // 数据读完后 Cursor 返回 0，视为设备关闭
        assert!(matches!(reader.read_frame(), Err(LinkUtilError::LinkReadError(_))));
    }

    #[test]
    fn test_stream_writer_writes_encoded_bytes() {
        let frame = SerialFrame::new(frame_types::STOP, 5, vec![]).expect("合法帧");
        let mut writer = StreamFrameWriter::new(Vec::new());
        writer.write_frame(&frame).expect("写入失败");
        assert_eq!(writer.inner, frame.encode().expect("编码失败"));
    }
}
