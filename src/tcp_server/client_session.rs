use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use common_models::enums::TelemetryTopic;
use common_models::payloads::{self, ErrorResponsePayload};
use log::{debug, error, warn};
use rust_link_utils::message::WireMessage;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock as StdRwLock};
use tokio::sync::{watch, Notify, RwLock};
use uuid::Uuid;

/// 向会话投递消息的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 已入队，但为此丢弃了最旧的一条遥测
    QueuedDroppedOldest,
    /// 会话已关闭，消息被丢弃
    Closed,
    /// 待发送的控制消息已达上限，消息未入队
    Overflow,
}

/// 每个会话默认最多积压的控制消息条数。
pub const DEFAULT_CONTROL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundClass {
    /// 应答、错误、链路状态等，从不丢弃；积压超过上限时会话被关闭
    Control,
    /// 遥测，受容量限制
    Telemetry,
}

#[derive(Debug)]
struct OutboundInner {
    queue: VecDeque<(OutboundClass, WireMessage)>,
    telemetry_len: usize,
    control_len: usize,
    dropped_telemetry: u64,
    closed: bool,
}

/// 会话的发送缓冲区。
///
/// 生产者 (路由、调度器) 只做入队，从不等待网络；唯一的消费者是会话的发送任务。
/// 关闭标记与入队在同一把锁下检查，关闭之后不会再有消息进入缓冲区。
#[derive(Debug)]
pub struct OutboundBuffer {
    inner: Mutex<OutboundInner>,
    notify: Notify,
    telemetry_capacity: usize,
    control_capacity: usize,
}

impl OutboundBuffer {
    pub fn new(telemetry_capacity: usize) -> Self {
        Self::with_capacities(telemetry_capacity, DEFAULT_CONTROL_CAPACITY)
    }

    pub fn with_capacities(telemetry_capacity: usize, control_capacity: usize) -> Self {
        OutboundBuffer {
            inner: Mutex::new(OutboundInner {
                queue: VecDeque::new(),
                telemetry_len: 0,
                control_len: 0,
                dropped_telemetry: 0,
                closed: false,
            }),
            notify: Notify::new(),
            telemetry_capacity: telemetry_capacity.max(1),
            control_capacity: control_capacity.max(1),
        }
    }

    pub fn control_capacity(&self) -> usize {
        self.control_capacity
    }

    fn lock(&self) -> MutexGuard<'_, OutboundInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 控制消息入队。积压已达上限时返回 [`PushOutcome::Overflow`]，消息不入队；
    /// 调用方应当用 [`push_final`](Self::push_final) 发出最后一条通知并关闭会话。
    pub fn push_control(&self, message: WireMessage) -> PushOutcome {
        {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            if inner.control_len >= self.control_capacity {
                return PushOutcome::Overflow;
            }
            inner.queue.push_back((OutboundClass::Control, message));
            inner.control_len += 1;
        }
        self.notify.notify_one();
        PushOutcome::Queued
    }

    /// 不受容量限制地追加最后一条控制消息，并在同一把锁下关闭缓冲区。
    pub fn push_final(&self, message: WireMessage) -> PushOutcome {
        {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            inner.queue.push_back((OutboundClass::Control, message));
            inner.control_len += 1;
            inner.closed = true;
        }
        self.notify.notify_one();
        PushOutcome::Queued
    }

    pub fn push_telemetry(&self, message: WireMessage) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let mut outcome = PushOutcome::Queued;
            if inner.telemetry_len >= self.telemetry_capacity {
                if let Some(oldest) = inner.queue.iter().position(|(class, _)| *class == OutboundClass::Telemetry) {
                    inner.queue.remove(oldest);
                    inner.telemetry_len -= 1;
                    inner.dropped_telemetry += 1;
                    outcome = PushOutcome::QueuedDroppedOldest;
                }
            }
            inner.queue.push_back((OutboundClass::Telemetry, message));
            inner.telemetry_len += 1;
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// 等待下一条待发送的消息。缓冲区关闭且已清空时返回 `None`。
    pub async fn pop(&self) -> Option<WireMessage> {
        loop {
            {
                let mut inner = self.lock();
                if let Some((class, message)) = inner.queue.pop_front() {
                    match class {
                        OutboundClass::Telemetry => inner.telemetry_len -= 1,
                        OutboundClass::Control => inner.control_len -= 1,
                    }
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// 关闭缓冲区。返回 `true` 表示本次调用完成了关闭。
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        self.notify.notify_one();
        newly_closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn telemetry_len(&self) -> usize {
        self.lock().telemetry_len
    }

    pub fn control_len(&self) -> usize {
        self.lock().control_len
    }

    /// 因缓冲区已满而丢弃的遥测条数。
    pub fn dropped_telemetry(&self) -> u64 {
        self.lock().dropped_telemetry
    }
}

/// 一个操作端连接的会话状态。
#[derive(Debug)]
pub struct ClientSession {
    pub client_id: Uuid,
    pub addr: SocketAddr,
    pub creation_time: DateTime<Utc>,
    /// 最近一次收到该客户端消息的时间，心跳监视器据此判断超时
    pub last_seen: Arc<RwLock<DateTime<Utc>>>,
    subscriptions: StdRwLock<HashSet<TelemetryTopic>>,
    pub outbound: OutboundBuffer,
    /// 会话应当关闭 (被移除、空闲超时、发送失败或进程关闭)
    pub connection_should_close: Arc<AtomicBool>,
    close_signal: watch::Sender<bool>,
}

impl ClientSession {
    pub fn new(addr: SocketAddr, telemetry_capacity: usize) -> Self {
        Self::with_capacities(addr, telemetry_capacity, DEFAULT_CONTROL_CAPACITY)
    }

    pub fn with_capacities(addr: SocketAddr, telemetry_capacity: usize, control_capacity: usize) -> Self {
        let now = Utc::now();
        let (close_signal, _) = watch::channel(false);
        Self {
            client_id: Uuid::new_v4(),
            addr,
            creation_time: now,
            last_seen: Arc::new(RwLock::new(now)),
            subscriptions: StdRwLock::new(HashSet::new()),
            outbound: OutboundBuffer::with_capacities(telemetry_capacity, control_capacity),
            connection_should_close: Arc::new(AtomicBool::new(false)),
            close_signal,
        }
    }

    /// 投递一条控制消息 (应答、错误、链路状态)。
    ///
    /// 客户端不读取导致积压超过上限时，追加一条 `ErrorResponse(OutboundOverflow)`
    /// 作为最后一条消息并关闭会话，返回 [`PushOutcome::Overflow`]。
    pub fn push_control(&self, message: WireMessage) -> PushOutcome {
        let outcome = self.outbound.push_control(message);
        if outcome == PushOutcome::Overflow {
            let capacity = self.outbound.control_capacity();
            warn!(
                "[ClientSession {}] 待发送的应答已积压 {} 条，客户端 {} 未在读取，关闭会话",
                self.client_id, capacity, self.addr
            );
            let error = BridgeError::OutboundOverflow(capacity);
            let payload = ErrorResponsePayload { original_message_type: None, kind: error.kind(), error: error.to_string() };
            match WireMessage::new(payloads::ERROR_RESPONSE_MESSAGE_TYPE, &payload) {
                Ok(notice) => {
                    self.outbound.push_final(notice);
                }
                Err(e) => error!("[ClientSession {}] 创建溢出通知失败: {}", self.client_id, e),
            }
            self.close();
        }
        outcome
    }

    pub async fn touch(&self) {
        *self.last_seen.write().await = Utc::now();
    }

    /// 返回 `true` 表示此前未订阅。
    pub fn subscribe(&self, topic: TelemetryTopic) -> bool {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner).insert(topic)
    }

    /// 返回 `true` 表示此前已订阅。
    pub fn unsubscribe(&self, topic: TelemetryTopic) -> bool {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner).remove(&topic)
    }

    pub fn is_subscribed(&self, topic: TelemetryTopic) -> bool {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner).contains(&topic)
    }

    pub fn subscribed_topics(&self) -> Vec<TelemetryTopic> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner).iter().copied().collect()
    }

    /// 标记会话关闭：不再接收投递，并唤醒等待 [`closed`](Self::closed) 的任务。
    /// 已经入队的消息仍会由发送任务发完。
    pub fn close(&self) {
        if self.outbound.close() {
            debug!("[ClientSession {}] 会话已标记为关闭", self.client_id);
        }
        self.connection_should_close.store(true, Ordering::SeqCst);
        self.close_signal.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.connection_should_close.load(Ordering::SeqCst)
    }

    /// 等待会话被关闭。
    pub async fn closed(&self) {
        let mut receiver = self.close_signal.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn message(tag: &str) -> WireMessage {
        WireMessage::new(tag, &json!({})).expect("创建消息失败")
    }

    fn session() -> ClientSession {
        ClientSession::new("127.0.0.1:9000".parse().expect("合法地址"), 2)
    }

    #[tokio::test]
    /// 遥测溢出时只丢弃最旧的遥测，控制消息不受影响，顺序保持不变。
    async fn test_overflow_drops_oldest_telemetry_only() {
        let buffer = OutboundBuffer::new(2);
        assert_eq!(buffer.push_telemetry(message("t1")), PushOutcome::Queued);
        assert_eq!(buffer.push_control(message("c1")), PushOutcome::Queued);
        assert_eq!(buffer.push_telemetry(message("t2")), PushOutcome::Queued);
        assert_eq!(buffer.push_telemetry(message("t3")), PushOutcome::QueuedDroppedOldest);
        assert_eq!(buffer.dropped_telemetry(), 1);
        assert_eq!(buffer.telemetry_len(), 2);

        let mut order = Vec::new();
        while !buffer.is_empty() {
            order.push(buffer.pop().await.expect("应当有消息").message_type);
        }
        assert_eq!(order, vec!["c1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_closed_buffer_rejects_new_messages_but_flushes_queued() {
        let buffer = OutboundBuffer::new(4);
        buffer.push_control(message("before"));
        assert!(buffer.close());
        assert!(!buffer.close(), "重复关闭不应再次报告");
        assert_eq!(buffer.push_control(message("after")), PushOutcome::Closed);
        assert_eq!(buffer.push_telemetry(message("after")), PushOutcome::Closed);

        assert_eq!(buffer.pop().await.map(|m| m.message_type), Some("before".to_string()));
        assert!(buffer.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_control_backlog_closes_session_with_notice() {
        let session = ClientSession::with_capacities("127.0.0.1:9001".parse().expect("合法地址"), 2, 3);
        for tag in ["c1", "c2", "c3"] {
            assert_eq!(session.push_control(message(tag)), PushOutcome::Queued);
        }
        assert!(!session.is_closed());

        assert_eq!(session.push_control(message("c4")), PushOutcome::Overflow);
        assert!(session.is_closed());
        assert_eq!(session.push_control(message("c5")), PushOutcome::Closed);
        assert_eq!(session.outbound.push_telemetry(message("t1")), PushOutcome::Closed);

        let mut flushed = Vec::new();
        while let Some(m) = session.outbound.pop().await {
            flushed.push(m);
        }
        let types: Vec<&str> = flushed.iter().map(|m| m.message_type.as_str()).collect();
        assert_eq!(types, vec!["c1", "c2", "c3", payloads::ERROR_RESPONSE_MESSAGE_TYPE]);
        let notice: ErrorResponsePayload = flushed[3].deserialize_payload().expect("错误负载解析失败");
        assert_eq!(notice.kind, common_models::enums::GatewayErrorKind::OutboundOverflow);
    }

    #[tokio::test]
    async fn test_control_capacity_frees_up_as_sender_drains() {
        let buffer = OutboundBuffer::with_capacities(2, 2);
        assert_eq!(buffer.push_control(message("c1")), PushOutcome::Queued);
        assert_eq!(buffer.push_control(message("c2")), PushOutcome::Queued);
        assert_eq!(buffer.push_control(message("c3")), PushOutcome::Overflow);
        assert_eq!(buffer.control_len(), 2);
        assert!(!buffer.is_closed(), "缓冲区本身不决定关闭会话");

        buffer.pop().await.expect("应当有消息");
        assert_eq!(buffer.push_control(message("c3")), PushOutcome::Queued);
        // 遥测不占用控制消息的配额
        assert_eq!(buffer.push_telemetry(message("t1")), PushOutcome::Queued);
        assert_eq!(buffer.control_len(), 2);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let buffer = Arc::new(OutboundBuffer::new(4));
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push_control(message("late"));
        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop 未被唤醒")
            .expect("任务 panic");
        assert_eq!(received.map(|m| m.message_type), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_session_close_wakes_waiters() {
        let session = Arc::new(session());
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        assert!(!session.is_closed());
        session.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() 未返回")
            .expect("任务 panic");
        assert!(session.is_closed());
        assert!(session.outbound.is_closed());
        // 已关闭后再等待立即返回
        tokio::time::timeout(Duration::from_millis(100), session.closed()).await.expect("应当立即返回");
    }

    #[test]
    fn test_subscriptions() {
        let session = session();
        assert!(session.subscribe(TelemetryTopic::Battery));
        assert!(!session.subscribe(TelemetryTopic::Battery));
        assert!(session.is_subscribed(TelemetryTopic::Battery));
        assert!(!session.is_subscribed(TelemetryTopic::Rfid));
        assert!(session.unsubscribe(TelemetryTopic::Battery));
        assert!(!session.unsubscribe(TelemetryTopic::Battery));
        assert!(session.subscribed_topics().is_empty());
    }
}
