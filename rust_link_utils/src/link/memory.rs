// rust_link_utils/src/link/memory.rs

//! 内存中的假串口设备。
//!
//! `MemoryLink` 同时扮演 [`LinkOpener`] 和 "下位机"：
//! - 网关写出的帧被记录下来，可以通过 [`MemoryLink::written_frames`] 检查；
//! - 可以注入下位机发出的帧 ([`MemoryLink::inject_frame`]) 或任意字节；
//! - 可以设置应答脚本 ([`MemoryLink::set_responder`])，对每一个写出的帧生成回复；
//! - 可以模拟拔出/插回设备、打开失败和写入失败。
//!
//! 克隆出来的 `MemoryLink` 共享同一个设备状态。

use super::{FrameReader, FrameWriter, LinkHandle, LinkOpener};
use crate::error::LinkUtilError;
use crate::frame::{FrameDecoder, SerialFrame, frame_types};
use log::warn;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 读端每次最多阻塞这么久，与真实串口的读超时行为一致。
const READ_POLL: Duration = Duration::from_millis(20);

/// 应答脚本：输入网关写出的帧，输出下位机要回复的 `(帧类型, 负载)` 列表。
pub type Responder = Arc<dyn Fn(&SerialFrame) -> Vec<(u8, Vec<u8>)> + Send + Sync>;

/// 对每个下行命令回复 ACK，对保活帧回复保活回显。
pub fn ack_every_command(frame: &SerialFrame) -> Vec<(u8, Vec<u8>)> {
    match frame.frame_type {
        frame_types::KEEPALIVE => vec![(frame_types::KEEPALIVE_ECHO, Vec::new())],
        t if t < frame_types::HOST_BOUND_MIN => vec![(frame_types::ACK, frame.sequence.to_be_bytes().to_vec())],
        _ => Vec::new(),
    }
}

struct MemoryLinkState {
    plugged: bool,
    generation: u64,
    open_count: usize,
    open_failures: usize,
    write_failures: usize,
    write_delay: Duration,
    writes_in_progress: usize,
    max_concurrent_writes: usize,
    inbound: VecDeque<u8>,
    written: Vec<SerialFrame>,
    written_bytes: Vec<u8>,
    mcu_sequence: u16,
    responder: Option<Responder>,
}

impl MemoryLinkState {
    fn is_live(&self, generation: u64) -> bool {
        self.plugged && self.generation == generation
    }

    fn push_mcu_frame(&mut self, frame_type: u8, payload: Vec<u8>) {
        let sequence = self.mcu_sequence;
        self.mcu_sequence = self.mcu_sequence.wrapping_add(1);
        match SerialFrame::new(frame_type, sequence, payload).and_then(|f| f.encode()) {
            Ok(bytes) => self.inbound.extend(bytes),
            Err(e) => warn!("[MemoryLink] 无法编码模拟的下位机帧 (type {:#04x}): {}", frame_type, e),
        }
    }
}

struct Shared {
    state: Mutex<MemoryLinkState>,
    readable: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MemoryLinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct MemoryLink {
    shared: Arc<Shared>,
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLink {
    /// 创建一个已插入、没有应答脚本的假设备。
    pub fn new() -> Self {
        MemoryLink {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryLinkState {
                    plugged: true,
                    generation: 0,
                    open_count: 0,
                    open_failures: 0,
                    write_failures: 0,
                    write_delay: Duration::ZERO,
                    writes_in_progress: 0,
                    max_concurrent_writes: 0,
                    inbound: VecDeque::new(),
                    written: Vec::new(),
                    written_bytes: Vec::new(),
                    mcu_sequence: 0,
                    responder: None,
                }),
                readable: Condvar::new(),
            }),
        }
    }

    /// 拔出设备：已打开的读写端立即失效，之后的打开都会失败，直到 [`replug`](Self::replug)。
    pub fn unplug(&self) {
        self.shared.lock().plugged = false;
        self.shared.readable.notify_all();
    }

    pub fn replug(&self) {
        self.shared.lock().plugged = true;
    }

    pub fn is_plugged(&self) -> bool {
        self.shared.lock().plugged
    }

    /// 接下来的 `n` 次打开失败。
    pub fn fail_next_opens(&self, n: usize) {
        self.shared.lock().open_failures = n;
    }

    /// 接下来的 `n` 次写入失败。
    pub fn fail_next_writes(&self, n: usize) {
        self.shared.lock().write_failures = n;
    }

    /// 每次写入耗时，用于观察写入是否重叠。
    pub fn set_write_delay(&self, delay: Duration) {
        self.shared.lock().write_delay = delay;
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&SerialFrame) -> Vec<(u8, Vec<u8>)> + Send + Sync + 'static,
    {
        self.shared.lock().responder = Some(Arc::new(responder));
    }

    pub fn clear_responder(&self) {
        self.shared.lock().responder = None;
    }

    /// 模拟下位机主动发出一帧，序列号由假设备自增分配。
    pub fn inject_frame(&self, frame_type: u8, payload: Vec<u8>) {
        self.shared.lock().push_mcu_frame(frame_type, payload);
        self.shared.readable.notify_all();
    }

    /// 注入任意字节 (例如损坏的帧或噪声)。
    pub fn inject_bytes(&self, bytes: &[u8]) {
        self.shared.lock().inbound.extend(bytes.iter().copied());
        self.shared.readable.notify_all();
    }

    /// 模拟下位机丢帧：跳过接下来 `n` 个序列号。
    pub fn skip_mcu_sequences(&self, n: u16) {
        let mut state = self.shared.lock();
        state.mcu_sequence = state.mcu_sequence.wrapping_add(n);
    }

    pub fn written_frames(&self) -> Vec<SerialFrame> {
        self.shared.lock().written.clone()
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.shared.lock().written_bytes.clone()
    }

    pub fn clear_written(&self) {
        let mut state = self.shared.lock();
        state.written.clear();
        state.written_bytes.clear();
    }

    /// 观察到的最大同时写入数，正常情况下应当始终为 1。
    pub fn max_concurrent_writes(&self) -> usize {
        self.shared.lock().max_concurrent_writes
    }

    /// 成功打开的次数。
    pub fn open_count(&self) -> usize {
        self.shared.lock().open_count
    }
}

impl LinkOpener for MemoryLink {
    fn open(&self) -> Result<LinkHandle, LinkUtilError> {
        let generation = {
            let mut state = self.shared.lock();
            if !state.plugged {
                return Err(LinkUtilError::LinkUnavailable("模拟设备未插入".to_string()));
            }
            if state.open_failures > 0 {
                state.open_failures -= 1;
                return Err(LinkUtilError::LinkUnavailable("模拟打开失败".to_string()));
            }
            state.generation += 1;
            state.open_count += 1;
            state.inbound.clear();
            state.generation
        };
        Ok(LinkHandle {
            reader: Box::new(MemoryFrameReader { shared: self.shared.clone(), generation, decoder: FrameDecoder::new() }),
            writer: Box::new(MemoryFrameWriter { shared: self.shared.clone(), generation }),
            description: self.describe(),
        })
    }

    fn describe(&self) -> String {
        "memory-link".to_string()
    }
}

struct MemoryFrameReader {
    shared: Arc<Shared>,
    generation: u64,
    decoder: FrameDecoder,
}

impl FrameReader for MemoryFrameReader {
    fn read_frame(&mut self) -> Result<Option<SerialFrame>, LinkUtilError> {
        if let Some(frame) = self.decoder.decode()? {
            return Ok(Some(frame));
        }
        let bytes: Vec<u8> = {
            let mut state = self.shared.lock();
            if state.inbound.is_empty() && state.is_live(self.generation) {
                state = match self.shared.readable.wait_timeout(state, READ_POLL) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            if !state.is_live(self.generation) {
                return Err(LinkUtilError::LinkReadError("模拟设备已拔出".to_string()));
            }
            state.inbound.drain(..).collect()
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        self.decoder.extend(&bytes);
        self.decoder.decode()
    }
}

struct MemoryFrameWriter {
    shared: Arc<Shared>,
    generation: u64,
}

impl FrameWriter for MemoryFrameWriter {
    fn write_frame(&mut self, frame: &SerialFrame) -> Result<(), LinkUtilError> {
        let bytes = frame.encode()?;
        let delay = {
            let mut state = self.shared.lock();
            if !state.is_live(self.generation) {
                return Err(LinkUtilError::LinkWriteError("模拟设备已拔出".to_string()));
            }
            if state.write_failures > 0 {
                state.write_failures -= 1;
                return Err(LinkUtilError::LinkWriteError("模拟写入失败".to_string()));
            }
            state.writes_in_progress += 1;
            state.max_concurrent_writes = state.max_concurrent_writes.max(state.writes_in_progress);
            state.write_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.shared.lock();
        state.writes_in_progress -= 1;
        if !state.is_live(self.generation) {
            return Err(LinkUtilError::LinkWriteError("写入过程中模拟设备被拔出".to_string()));
        }
        state.written_bytes.extend_from_slice(&bytes);
        state.written.push(frame.clone());
        let replies = state.responder.as_ref().map(|responder| responder(frame)).unwrap_or_default();
        let has_replies = !replies.is_empty();
        for (frame_type, payload) in replies {
            state.push_mcu_frame(frame_type, payload);
        }
        drop(state);
        if has_replies {
            self.shared.readable.notify_all();
        }
        Ok(())
    }
}
