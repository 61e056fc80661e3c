//! 桥接调度器。
//!
//! 调度器是一个独占串口写端的 Tokio 任务，负责：
//! - 按 FIFO 顺序从命令队列取出命令并逐条写入串口 (任意时刻最多一个写操作在进行)；
//! - 为带关联 ID 的命令登记待应答表项，收到 ACK/NACK 时只回给发起的会话，超时则回 `CommandTimeout`；
//! - 把下位机主动上报的帧解码为遥测，扇出给订阅了对应主题的会话；
//! - 维护链路状态机 `Disconnected → Connecting → Ready → Draining → Closed`，
//!   链路故障时让所有待应答命令立即失败、通知所有会话，并按指数退避重连；
//! - 链路空闲时发送保活帧；
//! - 收到关闭信号后在限定时间内排空队列。
//!
//! 串口的阻塞读写不在调度任务中执行：写操作放在阻塞线程池上 (`spawn_blocking`)，
//! 读操作由每一代链路独占的读线程完成，读到的帧以事件形式送回调度任务。
//! 每一代链路有自己的编号 (epoch)，旧链路迟到的事件和写入结果会被忽略。

use crate::bridge::backoff::Backoff;
use crate::bridge::codec::{decode_telemetry, encode_serial_frame, Command, CommandKind};
use crate::bridge::pending::{PendingCommand, PendingTable};
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::tcp_server::connection_manager::ConnectionManager;
use crate::tcp_server::message_router::{build_message, error_response_message};
use chrono::Utc;
use common_models::enums::LinkState;
use common_models::payloads::{self, AckPayload, LinkStatusPayload, TelemetryPayload};
use log::{debug, error, info, trace, warn};
use rust_link_utils::error::LinkUtilError;
use rust_link_utils::frame::{frame_types, SerialFrame};
use rust_link_utils::link::{FrameReader, FrameWriter, LinkHandle, LinkOpener};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// 队列中的一条命令。`origin` 为 `None` 表示网关内部生成 (例如保活帧)。
#[derive(Debug, Clone)]
pub struct OutboundEntry {
    pub command: Command,
    pub origin: Option<Uuid>,
}

/// 调度器的运行参数，由 [`AppConfig`] 换算而来。
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
    pub response_timeout: Duration,
    pub poll_interval: Duration,
    /// `None` 表示不发送保活帧
    pub keepalive_interval: Option<Duration>,
    pub drain_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub startup_retries: u32,
    pub write_failure_threshold: u32,
}

impl DispatcherSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            queue_capacity: config.server.inbound_queue_capacity,
            response_timeout: Duration::from_millis(config.bridge.response_timeout_ms),
            poll_interval: Duration::from_millis(config.bridge.poll_interval_ms),
            keepalive_interval: match config.bridge.keepalive_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            drain_timeout: Duration::from_millis(config.bridge.drain_timeout_ms),
            initial_backoff: Duration::from_millis(config.serial.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.serial.max_backoff_ms),
            startup_retries: config.serial.startup_retries,
            write_failure_threshold: config.serial.write_failure_threshold,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    corrupt_frames: AtomicU64,
    dropped_inbound: AtomicU64,
    timeouts: AtomicU64,
    write_errors: AtomicU64,
    link_failures: AtomicU64,
    pending: AtomicUsize,
}

/// 某一时刻的调度器计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub frames_written: u64,
    pub frames_read: u64,
    pub corrupt_frames: u64,
    /// 根据入站序列号空洞推算的丢帧数
    pub dropped_inbound: u64,
    pub timeouts: u64,
    pub write_errors: u64,
    pub link_failures: u64,
    pub pending_commands: usize,
}

impl DispatcherStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            dropped_inbound: self.dropped_inbound.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            link_failures: self.link_failures.load(Ordering::Relaxed),
            pending_commands: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// 供会话处理任务使用的调度器句柄，可以自由克隆。
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    queue_tx: mpsc::Sender<OutboundEntry>,
    state_rx: watch::Receiver<LinkState>,
    stats: Arc<DispatcherStats>,
}

impl DispatcherHandle {
    /// 把命令放入发送队列。
    ///
    /// 链路未就绪时立即返回 `LinkUnavailable`，关闭过程中返回 `ShuttingDown`；
    /// 队列已满时等待空位。
    pub async fn enqueue(&self, command: Command, origin: Option<Uuid>) -> Result<(), BridgeError> {
        let state = *self.state_rx.borrow();
        match state {
            LinkState::Ready => {}
            LinkState::Draining | LinkState::Closed => return Err(BridgeError::ShuttingDown),
            LinkState::Disconnected | LinkState::Connecting => return Err(BridgeError::LinkUnavailable),
        }
        self.queue_tx
            .send(OutboundEntry { command, origin })
            .await
            .map_err(|_| BridgeError::ShuttingDown)
    }

    pub fn link_state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pending_commands(&self) -> usize {
        self.stats.pending.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum LinkEventKind {
    Frame(SerialFrame),
    Corrupt(String),
    ReadFailed(String),
}

#[derive(Debug)]
struct LinkEvent {
    epoch: u64,
    kind: LinkEventKind,
}

struct WriteOutcome {
    writer: Box<dyn FrameWriter>,
    result: Result<(), LinkUtilError>,
    epoch: u64,
    sequence: u16,
    origin: Option<Uuid>,
    correlation_id: Option<u32>,
    message_type: &'static str,
}

pub struct BridgeDispatcher {
    opener: Arc<dyn LinkOpener>,
    settings: DispatcherSettings,
    connection_manager: Arc<ConnectionManager>,
    queue_rx: mpsc::Receiver<OutboundEntry>,
    state_tx: watch::Sender<LinkState>,
    stats: Arc<DispatcherStats>,
    pending: PendingTable,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    link_epoch: u64,
    writer: Option<Box<dyn FrameWriter>>,
    reader_stop: Option<Arc<AtomicBool>>,
    write_slot: Option<JoinHandle<WriteOutcome>>,
    connect_slot: Option<JoinHandle<Result<LinkHandle, LinkUtilError>>>,
    reconnect_at: Option<Instant>,
    backoff: Backoff,
    next_sequence: u16,
    consecutive_write_failures: u32,
    last_write_at: Instant,
    last_inbound_sequence: Option<u16>,
}

/// 等待槽位中的任务完成；槽位为空时永远挂起。可以在 `select!` 中安全取消。
async fn wait_slot<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match slot.as_mut() {
        Some(handle) => {
            let result = handle.await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader(
    mut reader: Box<dyn FrameReader>,
    epoch: u64,
    stop: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("serial-reader-{}", epoch))
        .spawn(move || {
            debug!("[SerialReader {}] 读线程已启动", epoch);
            while !stop.load(Ordering::SeqCst) {
                let kind = match reader.read_frame() {
                    Ok(Some(frame)) => LinkEventKind::Frame(frame),
                    Ok(None) => continue,
                    Err(LinkUtilError::FrameCorrupt(detail)) => LinkEventKind::Corrupt(detail),
                    Err(e) => {
                        if !stop.load(Ordering::SeqCst) {
                            let _ = events.send(LinkEvent { epoch, kind: LinkEventKind::ReadFailed(e.to_string()) });
                        }
                        break;
                    }
                };
                if events.send(LinkEvent { epoch, kind }).is_err() {
                    break;
                }
            }
            debug!("[SerialReader {}] 读线程已退出", epoch);
        })
        .map(|_| ())
}

/// 启动时打开串口，最多尝试 `startup_retries` 次，两次尝试之间按退避等待。
async fn open_with_retries(opener: &Arc<dyn LinkOpener>, settings: &DispatcherSettings) -> Result<LinkHandle, LinkUtilError> {
    let attempts = settings.startup_retries.max(1);
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);
    let mut attempt = 1;
    loop {
        let opener_for_task = Arc::clone(opener);
        let opened = tokio::task::spawn_blocking(move || opener_for_task.open())
            .await
            .unwrap_or_else(|e| Err(LinkUtilError::LinkUnavailable(format!("打开串口的任务异常: {}", e))));
        match opened {
            Ok(handle) => return Ok(handle),
            Err(e) if attempt >= attempts => {
                error!("[BridgeDispatcher] 第 {}/{} 次打开串口 {} 失败: {}。放弃。", attempt, attempts, opener.describe(), e);
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "[BridgeDispatcher] 第 {}/{} 次打开串口 {} 失败: {}。{:?} 后重试。",
                    attempt,
                    attempts,
                    opener.describe(),
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

impl BridgeDispatcher {
    /// 打开串口并启动调度任务。
    ///
    /// 启动阶段打开失败 (用尽重试次数) 时返回错误，调用方应当以非零状态退出。
    /// `shutdown` 变为 `true` 后调度器进入排空流程，任务在状态变为 `Closed` 后结束。
    pub async fn start(
        opener: Arc<dyn LinkOpener>,
        settings: DispatcherSettings,
        connection_manager: Arc<ConnectionManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(DispatcherHandle, JoinHandle<()>), LinkUtilError> {
        let link = open_with_retries(&opener, &settings).await?;

        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DispatcherStats::default());

        let mut dispatcher = BridgeDispatcher {
            backoff: Backoff::new(settings.initial_backoff, settings.max_backoff),
            opener,
            settings,
            connection_manager,
            queue_rx,
            state_tx,
            stats: Arc::clone(&stats),
            pending: PendingTable::new(),
            events_tx,
            events_rx,
            link_epoch: 0,
            writer: None,
            reader_stop: None,
            write_slot: None,
            connect_slot: None,
            reconnect_at: None,
            next_sequence: 0,
            consecutive_write_failures: 0,
            last_write_at: Instant::now(),
            last_inbound_sequence: None,
        };
        dispatcher.install_link(link);

        let handle = DispatcherHandle { queue_tx, state_rx, stats };
        let task = tokio::spawn(dispatcher.run(shutdown));
        Ok((handle, task))
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("[BridgeDispatcher] 调度循环已启动，链路: {}", self.opener.describe());
        let mut sweep = tokio::time::interval(self.settings.poll_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let accept_queue = self.write_slot.is_none() || self.state() != LinkState::Ready;
            let reconnect_at = self.reconnect_at;
            let keepalive_at = self.keepalive_deadline();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                entry = self.queue_rx.recv(), if accept_queue => match entry {
                    Some(entry) => self.handle_entry(entry),
                    None => {
                        info!("[BridgeDispatcher] 所有命令发送端均已释放");
                        break;
                    }
                },
                outcome = wait_slot(&mut self.write_slot) => self.finish_write(outcome),
                Some(event) = self.events_rx.recv() => self.handle_link_event(event),
                opened = wait_slot(&mut self.connect_slot) => self.finish_connect(opened),
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.begin_connect();
                }
                _ = sleep_until_opt(keepalive_at) => self.send_keepalive(),
                _ = sweep.tick() => self.sweep_expired(),
            }
        }

        self.drain().await;
    }

    fn handle_entry(&mut self, entry: OutboundEntry) {
        if self.state() != LinkState::Ready || self.writer.is_none() {
            self.reject(&entry, BridgeError::LinkUnavailable);
            return;
        }
        self.start_write(entry.command, entry.origin);
    }

    /// 跳过仍在等待应答的序列号。
    fn allocate_sequence(&mut self) -> u16 {
        for _ in 0..=u16::MAX {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if !self.pending.contains(sequence) {
                return sequence;
            }
        }
        self.next_sequence
    }

    fn start_write(&mut self, command: Command, origin: Option<Uuid>) {
        let Some(mut writer) = self.writer.take() else {
            self.reject(&OutboundEntry { command, origin }, BridgeError::LinkUnavailable);
            return;
        };
        let sequence = self.allocate_sequence();
        let message_type = command.kind.message_type();
        let frame = match encode_serial_frame(&command, sequence) {
            Ok(frame) => frame,
            Err(e) => {
                self.writer = Some(writer);
                if let Some(origin) = origin {
                    self.send_error(origin, command.correlation_id, message_type, &e);
                }
                return;
            }
        };

        if let (Some(origin), Some(correlation_id)) = (origin, command.correlation_id) {
            self.pending.insert(
                sequence,
                PendingCommand {
                    origin,
                    correlation_id,
                    message_type,
                    deadline: Instant::now() + self.settings.response_timeout,
                },
            );
            self.sync_pending_gauge();
        }

        trace!(
            "[BridgeDispatcher] 写出帧: type={:#04x}, seq={}, len={}",
            frame.frame_type,
            frame.sequence,
            frame.payload.len()
        );
        let epoch = self.link_epoch;
        let correlation_id = command.correlation_id;
        self.write_slot = Some(tokio::task::spawn_blocking(move || {
            let result = writer.write_frame(&frame);
            WriteOutcome { writer, result, epoch, sequence, origin, correlation_id, message_type }
        }));
    }

    fn finish_write(&mut self, outcome: Result<WriteOutcome, JoinError>) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[BridgeDispatcher] 写任务异常终止: {}", e);
                self.link_failed(format!("写任务异常终止: {}", e));
                return;
            }
        };
        if outcome.epoch != self.link_epoch {
            debug!("[BridgeDispatcher] 丢弃旧链路 (epoch {}) 的写入结果", outcome.epoch);
            return;
        }
        self.writer = Some(outcome.writer);

        match outcome.result {
            Ok(()) => {
                DispatcherStats::bump(&self.stats.frames_written, 1);
                self.consecutive_write_failures = 0;
                self.last_write_at = Instant::now();
            }
            Err(e) => {
                DispatcherStats::bump(&self.stats.write_errors, 1);
                self.consecutive_write_failures += 1;
                warn!(
                    "[BridgeDispatcher] 写入 seq={} ({}) 失败 (连续第 {} 次): {}",
                    outcome.sequence, outcome.message_type, self.consecutive_write_failures, e
                );
                let error = BridgeError::LinkWriteError(e.to_string());
                if let Some(pending) = self.pending.remove(outcome.sequence) {
                    self.sync_pending_gauge();
                    self.send_error(pending.origin, Some(pending.correlation_id), pending.message_type, &error);
                } else if let Some(origin) = outcome.origin {
                    self.send_error(origin, outcome.correlation_id, outcome.message_type, &error);
                }
                if self.consecutive_write_failures >= self.settings.write_failure_threshold {
                    let reason = format!("连续 {} 次写入失败", self.consecutive_write_failures);
                    self.link_failed(reason);
                }
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if event.epoch != self.link_epoch {
            trace!("[BridgeDispatcher] 忽略旧链路 (epoch {}) 的事件", event.epoch);
            return;
        }
        match event.kind {
            LinkEventKind::Frame(frame) => self.handle_frame(frame),
            LinkEventKind::Corrupt(detail) => {
                DispatcherStats::bump(&self.stats.corrupt_frames, 1);
                warn!("[BridgeDispatcher] 丢弃损坏的串口帧: {}", detail);
            }
            LinkEventKind::ReadFailed(reason) => self.link_failed(format!("串口读取失败: {}", reason)),
        }
    }

    fn track_inbound_sequence(&mut self, sequence: u16) {
        if let Some(last) = self.last_inbound_sequence {
            let expected = last.wrapping_add(1);
            let gap = sequence.wrapping_sub(expected);
            if gap != 0 && gap < u16::MAX / 2 {
                DispatcherStats::bump(&self.stats.dropped_inbound, u64::from(gap));
                warn!(
                    "[BridgeDispatcher] 入站序列号不连续: 期望 {}，收到 {}，推测丢失 {} 帧",
                    expected, sequence, gap
                );
            } else if gap != 0 {
                debug!("[BridgeDispatcher] 收到重复或乱序的入站帧: seq={} (上一帧 {})", sequence, last);
            }
        }
        self.last_inbound_sequence = Some(sequence);
    }

    fn handle_frame(&mut self, frame: SerialFrame) {
        DispatcherStats::bump(&self.stats.frames_read, 1);
        self.track_inbound_sequence(frame.sequence);

        if frame.is_acknowledgement() {
            let Some(acked) = frame.acked_sequence() else {
                warn!("[BridgeDispatcher] 应答帧负载过短: {:?}", frame.payload);
                return;
            };
            match self.pending.remove(acked) {
                Some(pending) => {
                    self.sync_pending_gauge();
                    let payload = AckPayload {
                        original_message_type: Some(pending.message_type.to_string()),
                        sequence: Some(acked),
                        accepted: frame.frame_type == frame_types::ACK,
                        code: frame.nack_code(),
                    };
                    if let Some(message) = build_message(payloads::ACK_MESSAGE_TYPE, &payload, Some(pending.correlation_id)) {
                        self.connection_manager.send_to(&pending.origin, message);
                    }
                }
                None => debug!("[BridgeDispatcher] 收到未登记序列号 {} 的应答，忽略", acked),
            }
            return;
        }

        let (topic, data) = decode_telemetry(&frame);
        let payload = TelemetryPayload { topic, sequence: frame.sequence, received_at: Utc::now(), data };
        if let Some(message) = build_message(payloads::TELEMETRY_MESSAGE_TYPE, &payload, None) {
            let delivered = self.connection_manager.fan_out_telemetry(topic, &message);
            trace!("[BridgeDispatcher] 遥测 {} (seq={}) 已投递给 {} 个会话", topic, frame.sequence, delivered);
        }
    }

    /// 链路故障：`Ready` 时进入 `Disconnected` 并安排重连；排空过程中只清理链路。
    fn link_failed(&mut self, reason: String) {
        let state = self.state();
        self.teardown_link();
        match state {
            LinkState::Ready => {
                DispatcherStats::bump(&self.stats.link_failures, 1);
                warn!("[BridgeDispatcher] 串口链路故障: {}", reason);
                self.set_state(LinkState::Disconnected, Some(reason));
                self.fail_all_pending(&BridgeError::LinkDown);
                self.schedule_reconnect();
            }
            LinkState::Draining => {
                warn!("[BridgeDispatcher] 排空过程中串口链路故障: {}", reason);
                self.fail_all_pending(&BridgeError::LinkDown);
            }
            _ => debug!("[BridgeDispatcher] 链路已不可用 ({}): {}", state, reason),
        }
    }

    fn teardown_link(&mut self) {
        self.link_epoch = self.link_epoch.wrapping_add(1);
        if let Some(stop) = self.reader_stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        self.writer = None;
        self.consecutive_write_failures = 0;
        self.last_inbound_sequence = None;
    }

    fn install_link(&mut self, link: LinkHandle) {
        self.link_epoch = self.link_epoch.wrapping_add(1);
        let stop = Arc::new(AtomicBool::new(false));
        if let Err(e) = spawn_reader(link.reader, self.link_epoch, Arc::clone(&stop), self.events_tx.clone()) {
            error!("[BridgeDispatcher] 无法启动串口读线程: {}", e);
            self.teardown_link();
            self.set_state(LinkState::Disconnected, Some(format!("无法启动读线程: {}", e)));
            self.schedule_reconnect();
            return;
        }
        self.reader_stop = Some(stop);
        self.writer = Some(link.writer);
        self.backoff.reset();
        self.consecutive_write_failures = 0;
        self.last_inbound_sequence = None;
        self.last_write_at = Instant::now();
        self.set_state(LinkState::Ready, Some(link.description));
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        info!("[BridgeDispatcher] {:?} 后尝试重新打开串口 {}", delay, self.opener.describe());
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn begin_connect(&mut self) {
        if self.connect_slot.is_some() {
            return;
        }
        self.set_state(LinkState::Connecting, None);
        let opener = Arc::clone(&self.opener);
        self.connect_slot = Some(tokio::task::spawn_blocking(move || opener.open()));
    }

    fn finish_connect(&mut self, opened: Result<Result<LinkHandle, LinkUtilError>, JoinError>) {
        let opened = opened.unwrap_or_else(|e| Err(LinkUtilError::LinkUnavailable(format!("打开串口的任务异常: {}", e))));
        match opened {
            Ok(link) => {
                info!("[BridgeDispatcher] 串口链路已恢复: {}", link.description);
                self.install_link(link);
            }
            Err(e) => {
                debug!("[BridgeDispatcher] 重新打开串口失败: {}", e);
                self.set_state(LinkState::Disconnected, Some(e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    fn keepalive_deadline(&self) -> Option<Instant> {
        let interval = self.settings.keepalive_interval?;
        if self.state() != LinkState::Ready || self.write_slot.is_some() || self.writer.is_none() {
            return None;
        }
        Some(self.last_write_at + interval)
    }

    fn send_keepalive(&mut self) {
        if self.state() == LinkState::Ready && self.write_slot.is_none() && self.writer.is_some() {
            trace!("[BridgeDispatcher] 链路空闲，发送保活帧");
            self.start_write(Command::new(CommandKind::KeepAlive, None), None);
        }
    }

    fn sweep_expired(&mut self) {
        let expired = self.pending.take_expired(Instant::now());
        if expired.is_empty() {
            return;
        }
        self.sync_pending_gauge();
        let error = BridgeError::CommandTimeout(self.settings.response_timeout.as_millis() as u64);
        for (sequence, pending) in expired {
            DispatcherStats::bump(&self.stats.timeouts, 1);
            warn!(
                "[BridgeDispatcher] 命令 seq={} ({}, 会话 {}) 等待应答超时",
                sequence, pending.message_type, pending.origin
            );
            self.send_error(pending.origin, Some(pending.correlation_id), pending.message_type, &error);
        }
    }

    fn fail_all_pending(&mut self, error: &BridgeError) {
        let failed = self.pending.drain_all();
        self.sync_pending_gauge();
        for (_, pending) in failed {
            self.send_error(pending.origin, Some(pending.correlation_id), pending.message_type, error);
        }
    }

    fn sync_pending_gauge(&self) {
        self.stats.pending.store(self.pending.len(), Ordering::Relaxed);
    }

    fn reject(&self, entry: &OutboundEntry, error: BridgeError) {
        if let Some(origin) = entry.origin {
            self.send_error(origin, entry.command.correlation_id, entry.command.kind.message_type(), &error);
        }
    }

    fn send_error(&self, origin: Uuid, correlation_id: Option<u32>, message_type: &str, error: &BridgeError) {
        if let Some(message) = error_response_message(Some(message_type), error, correlation_id) {
            self.connection_manager.send_to(&origin, message);
        }
    }

    fn set_state(&mut self, new_state: LinkState, detail: Option<String>) {
        let previous = self.state_tx.send_replace(new_state);
        if previous == new_state {
            return;
        }
        match &detail {
            Some(detail) => info!("[BridgeDispatcher] 链路状态: {} -> {} ({})", previous, new_state, detail),
            None => info!("[BridgeDispatcher] 链路状态: {} -> {}", previous, new_state),
        }
        let notify_sessions = match new_state {
            LinkState::Ready | LinkState::Draining | LinkState::Closed => true,
            LinkState::Disconnected => previous == LinkState::Ready,
            LinkState::Connecting => false,
        };
        if notify_sessions {
            let payload = LinkStatusPayload { state: new_state, detail, changed_at: Utc::now() };
            if let Some(message) = build_message(payloads::LINK_STATUS_MESSAGE_TYPE, &payload, None) {
                self.connection_manager.broadcast(&message);
            }
        }
    }

    /// 关闭流程：停止接收新命令，在 `drain_timeout` 内写完已入队的命令并等待应答，
    /// 其余命令和待应答表项以 `ShuttingDown` 失败，最后停止读线程。
    async fn drain(&mut self) {
        let link_was_ready = self.state() == LinkState::Ready;
        self.queue_rx.close();
        self.reconnect_at = None;
        self.connect_slot = None;
        self.set_state(LinkState::Draining, None);

        let deadline = Instant::now() + self.settings.drain_timeout;
        let mut sweep = tokio::time::interval(self.settings.poll_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flushed = 0usize;

        loop {
            if self.write_slot.is_none() {
                match self.queue_rx.try_recv() {
                    Ok(entry) => {
                        if link_was_ready && self.writer.is_some() {
                            self.start_write(entry.command, entry.origin);
                            flushed += 1;
                        } else {
                            self.reject(&entry, BridgeError::ShuttingDown);
                        }
                        continue;
                    }
                    Err(_) if self.pending.is_empty() => break,
                    Err(_) => {}
                }
            }
            tokio::select! {
                outcome = wait_slot(&mut self.write_slot) => self.finish_write(outcome),
                Some(event) = self.events_rx.recv() => self.handle_link_event(event),
                _ = sweep.tick() => self.sweep_expired(),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("[BridgeDispatcher] 排空超时 ({:?})，放弃剩余命令", self.settings.drain_timeout);
                    break;
                }
            }
        }

        while let Ok(entry) = self.queue_rx.try_recv() {
            self.reject(&entry, BridgeError::ShuttingDown);
        }
        self.write_slot = None;
        self.fail_all_pending(&BridgeError::ShuttingDown);
        self.teardown_link();
        self.set_state(LinkState::Closed, None);
        info!("[BridgeDispatcher] 调度器已关闭，排空期间下发 {} 条命令", flushed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_server::client_session::ClientSession;
    use common_models::enums::{GatewayErrorKind, TelemetryTopic};
    use common_models::payloads::{ErrorResponsePayload, TelemetryData};
    use rust_link_utils::link::memory::{ack_every_command, MemoryLink};
    use rust_link_utils::message::WireMessage;

    fn test_settings() -> DispatcherSettings {
        DispatcherSettings {
            queue_capacity: 16,
            response_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            keepalive_interval: None,
            drain_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            startup_retries: 2,
            write_failure_threshold: 3,
        }
    }

    async fn start(
        link: &MemoryLink,
        settings: DispatcherSettings,
    ) -> (Arc<ConnectionManager>, DispatcherHandle, JoinHandle<()>, watch::Sender<bool>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let manager = Arc::new(ConnectionManager::new(8));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = BridgeDispatcher::start(Arc::new(link.clone()), settings, manager.clone(), shutdown_rx)
            .await
            .expect("调度器启动失败");
        (manager, handle, task, shutdown_tx)
    }

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:6000".parse().expect("合法地址")
    }

    async fn next_of_type(session: &ClientSession, message_type: &str) -> WireMessage {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let message = session.outbound.pop().await.expect("会话意外关闭");
                if message.message_type == message_type {
                    return message;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("等待 {} 消息超时", message_type))
    }

    async fn wait_for_state(handle: &DispatcherHandle, expected: LinkState) {
        let mut state_rx = handle.subscribe_state();
        tokio::time::timeout(Duration::from_secs(3), state_rx.wait_for(|state| *state == expected))
            .await
            .unwrap_or_else(|_| panic!("链路状态没有变为 {}", expected))
            .expect("调度器已退出");
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..150 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("条件在预期时间内没有满足");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ack_is_routed_to_origin_only() {
        let link = MemoryLink::new();
        link.set_responder(ack_every_command);
        let (manager, handle, _task, _shutdown) = start(&link, test_settings()).await;
        let sender = manager.add_client(peer());
        let bystander = manager.add_client(peer());

        handle
            .enqueue(Command::new(CommandKind::Stop, Some(1)), Some(sender.client_id))
            .await
            .expect("入队失败");

        let ack = next_of_type(&sender, payloads::ACK_MESSAGE_TYPE).await;
        assert_eq!(ack.correlation_id, Some(1));
        let payload: AckPayload = ack.deserialize_payload().expect("Ack 负载解析失败");
        assert!(payload.accepted);
        assert_eq!(payload.original_message_type.as_deref(), Some("Stop"));
        assert!(bystander.outbound.is_empty());
        assert_eq!(handle.pending_commands(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nack_is_reported_as_rejected() {
        let link = MemoryLink::new();
        link.set_responder(|frame| vec![(frame_types::NACK, vec![(frame.sequence >> 8) as u8, frame.sequence as u8, 0x03])]);
        let (manager, handle, _task, _shutdown) = start(&link, test_settings()).await;
        let session = manager.add_client(peer());

        handle
            .enqueue(Command::new(CommandKind::SetToolId { tool: 2 }, Some(9)), Some(session.client_id))
            .await
            .expect("入队失败");
        let ack: AckPayload = next_of_type(&session, payloads::ACK_MESSAGE_TYPE)
            .await
            .deserialize_payload()
            .expect("Ack 负载解析失败");
        assert!(!ack.accepted);
        assert_eq!(ack.code, Some(0x03));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_ack_times_out() {
        let link = MemoryLink::new();
        let (manager, handle, _task, _shutdown) = start(&link, test_settings()).await;
        let session = manager.add_client(peer());

        handle
            .enqueue(Command::new(CommandKind::Stop, Some(4)), Some(session.client_id))
            .await
            .expect("入队失败");
        let error = next_of_type(&session, payloads::ERROR_RESPONSE_MESSAGE_TYPE).await;
        assert_eq!(error.correlation_id, Some(4));
        let payload: ErrorResponsePayload = error.deserialize_payload().expect("错误负载解析失败");
        assert_eq!(payload.kind, GatewayErrorKind::CommandTimeout);
        assert_eq!(handle.pending_commands(), 0);
        assert_eq!(handle.stats().timeouts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unplug_fails_pending_and_reconnects() {
        let link = MemoryLink::new();
        let mut settings = test_settings();
        settings.response_timeout = Duration::from_secs(10);
        let (manager, handle, _task, _shutdown) = start(&link, settings).await;
        let session = manager.add_client(peer());

        handle
            .enqueue(Command::new(CommandKind::Stop, Some(7)), Some(session.client_id))
            .await
            .expect("入队失败");
        eventually(|| handle.pending_commands() == 1).await;

        link.unplug();
        let error: ErrorResponsePayload = next_of_type(&session, payloads::ERROR_RESPONSE_MESSAGE_TYPE)
            .await
            .deserialize_payload()
            .expect("错误负载解析失败");
        assert_eq!(error.kind, GatewayErrorKind::LinkDown);
        assert_ne!(handle.link_state(), LinkState::Ready);
        assert_eq!(
            handle.enqueue(Command::new(CommandKind::Stop, Some(8)), Some(session.client_id)).await,
            Err(BridgeError::LinkUnavailable)
        );

        link.replug();
        wait_for_state(&handle, LinkState::Ready).await;
        assert_eq!(link.open_count(), 2);
        assert_eq!(handle.stats().link_failures, 1);
        handle.enqueue(Command::new(CommandKind::Stop, None), None).await.expect("重连后应当可以入队");
        eventually(|| link.written_frames().len() == 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_gives_up_after_retries() {
        let _ = env_logger::builder().is_test(true).try_init();
        let link = MemoryLink::new();
        link.fail_next_opens(10);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = BridgeDispatcher::start(
            Arc::new(link.clone()),
            test_settings(),
            Arc::new(ConnectionManager::new(8)),
            shutdown_rx,
        )
        .await;
        assert!(started.is_err());
        assert_eq!(link.open_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_consecutive_write_failures_take_link_down() {
        let link = MemoryLink::new();
        link.fail_next_writes(3);
        let (manager, handle, _task, _shutdown) = start(&link, test_settings()).await;
        let session = manager.add_client(peer());

        for correlation_id in 1..=3 {
            handle
                .enqueue(Command::new(CommandKind::Stop, Some(correlation_id)), Some(session.client_id))
                .await
                .expect("入队失败");
            let error = next_of_type(&session, payloads::ERROR_RESPONSE_MESSAGE_TYPE).await;
            assert_eq!(error.correlation_id, Some(correlation_id));
            let payload: ErrorResponsePayload = error.deserialize_payload().expect("错误负载解析失败");
            assert_eq!(payload.kind, GatewayErrorKind::LinkWriteError);
        }

        eventually(|| handle.stats().link_failures == 1).await;
        wait_for_state(&handle, LinkState::Ready).await;
        assert_eq!(link.open_count(), 2);
        assert_eq!(handle.stats().write_errors, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inbound_sequence_gap_is_counted() {
        let link = MemoryLink::new();
        let (manager, handle, _task, _shutdown) = start(&link, test_settings()).await;
        let session = manager.add_client(peer());
        manager.subscribe(&session.client_id, TelemetryTopic::Battery);

        link.inject_frame(frame_types::BATTERY, vec![255]);
        link.skip_mcu_sequences(2);
        link.inject_frame(frame_types::BATTERY, vec![0]);

        let first: TelemetryPayload = next_of_type(&session, payloads::TELEMETRY_MESSAGE_TYPE)
            .await
            .deserialize_payload()
            .expect("遥测负载解析失败");
        let second: TelemetryPayload = next_of_type(&session, payloads::TELEMETRY_MESSAGE_TYPE)
            .await
            .deserialize_payload()
            .expect("遥测负载解析失败");
        assert_eq!(second.sequence, first.sequence.wrapping_add(3));
        assert_eq!(handle.stats().dropped_inbound, 2);
        assert_eq!(handle.stats().frames_read, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    /// 噪声和校验失败的帧被计数后丢弃，紧随其后的正常帧照常推送。
    async fn test_corrupt_frame_is_counted_and_stream_recovers() {
        let link = MemoryLink::new();
        let (manager, handle, _task, _shutdown) = start(&link, test_settings()).await;
        let session = manager.add_client(peer());
        manager.subscribe(&session.client_id, TelemetryTopic::Battery);

        let mut damaged = SerialFrame::new(frame_types::BATTERY, 0, vec![50])
            .expect("负载长度合法")
            .encode()
            .expect("编码失败");
        let last = damaged.len() - 1;
        damaged[last] ^= 0xFF;
        link.inject_bytes(&[0x00, 0x13, 0x37]);
        link.inject_bytes(&damaged);
        link.inject_frame(frame_types::BATTERY, vec![200]);

        let telemetry: TelemetryPayload = next_of_type(&session, payloads::TELEMETRY_MESSAGE_TYPE)
            .await
            .deserialize_payload()
            .expect("遥测负载解析失败");
        assert_eq!(telemetry.topic, TelemetryTopic::Battery);
        match telemetry.data {
            TelemetryData::Battery { raw, .. } => assert_eq!(raw, 200),
            other => panic!("期望电量遥测，实际为 {:?}", other),
        }
        assert_eq!(handle.stats().corrupt_frames, 1);
        assert_eq!(handle.stats().frames_read, 1);
        assert_eq!(handle.link_state(), LinkState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_queue_then_closes() {
        let link = MemoryLink::new();
        link.set_responder(ack_every_command);
        link.set_write_delay(Duration::from_millis(30));
        let (manager, handle, task, shutdown) = start(&link, test_settings()).await;
        let session = manager.add_client(peer());

        for correlation_id in 1..=5 {
            handle
                .enqueue(Command::new(CommandKind::Stop, Some(correlation_id)), Some(session.client_id))
                .await
                .expect("入队失败");
        }
        shutdown.send(true).expect("发送关闭信号失败");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("调度器没有在排空后退出")
            .expect("调度任务 panic");

        assert_eq!(link.written_frames().len(), 5);
        assert_eq!(link.max_concurrent_writes(), 1);
        assert_eq!(handle.link_state(), LinkState::Closed);
        assert_eq!(
            handle.enqueue(Command::new(CommandKind::Stop, None), None).await,
            Err(BridgeError::ShuttingDown)
        );
        for correlation_id in 1..=5 {
            let ack = next_of_type(&session, payloads::ACK_MESSAGE_TYPE).await;
            assert_eq!(ack.correlation_id, Some(correlation_id));
        }
    }
}
