//! 负责处理从操作端接收到的消息，并根据消息类型进行分发处理。
//!
//! - `Ping` / `StatusRequest` / `Subscribe` / `Unsubscribe` 由网关本地应答；
//! - 其余合法命令交给桥接调度器下发到串口，结果 (Ack / ErrorResponse) 由调度器异步回送；
//! - 无法解析的消息回复 `ErrorResponse(MalformedCommand)` 后关闭会话。
//!
//! 所有应答都通过会话的发送缓冲区投递，路由本身从不等待网络。

use crate::bridge::codec::{decode_client_command, CommandKind};
use crate::bridge::dispatcher::DispatcherHandle;
use crate::error::BridgeError;
use crate::hotspot::HotspotStatusCache;
use crate::tcp_server::client_session::{ClientSession, PushOutcome};
use crate::tcp_server::connection_manager::ConnectionManager;
use common_models::payloads::{self, AckPayload, EmptyPayload, ErrorResponsePayload, StatusPayload};
use log::{debug, error, warn};
use rust_link_utils::message::WireMessage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// 路由处理消息所需的共享状态。
#[derive(Clone)]
pub struct RouterContext {
    pub connection_manager: Arc<ConnectionManager>,
    pub dispatcher: DispatcherHandle,
    pub hotspot_status: HotspotStatusCache,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Continue,
    /// 会话应当关闭
    Terminate,
}

/// 创建一条网关发出的消息。序列化失败只记录错误并返回 `None`。
pub fn build_message<T: Serialize>(message_type: &str, payload: &T, correlation_id: Option<u32>) -> Option<WireMessage> {
    match WireMessage::new(message_type, payload) {
        Ok(message) => Some(message.with_correlation_id(correlation_id)),
        Err(e) => {
            error!("[MessageRouter] 创建 {} 消息失败: {}", message_type, e);
            None
        }
    }
}

pub fn error_response_message(
    original_message_type: Option<&str>,
    error: &BridgeError,
    correlation_id: Option<u32>,
) -> Option<WireMessage> {
    let payload = ErrorResponsePayload {
        original_message_type: original_message_type.map(str::to_string),
        kind: error.kind(),
        error: error.to_string(),
    };
    build_message(payloads::ERROR_RESPONSE_MESSAGE_TYPE, &payload, correlation_id)
}

fn reply<T: Serialize>(session: &ClientSession, message_type: &str, payload: &T, correlation_id: Option<u32>) {
    let Some(message) = build_message(message_type, payload, correlation_id) else {
        return;
    };
    if session.push_control(message) == PushOutcome::Closed {
        debug!("[MessageRouter] 会话 {} 已关闭，丢弃 {} 应答", session.client_id, message_type);
    }
}

/// 辅助函数：向客户端发送标准错误响应。
pub fn send_error_response(
    session: &ClientSession,
    original_message_type: Option<&str>,
    error: &BridgeError,
    correlation_id: Option<u32>,
) {
    if let Some(message) = error_response_message(original_message_type, error, correlation_id) {
        if session.push_control(message) == PushOutcome::Closed {
            debug!("[MessageRouter] 会话 {} 已关闭，丢弃 ErrorResponse: {}", session.client_id, error);
        }
    }
}

fn local_ack(message_type: &str) -> AckPayload {
    AckPayload { original_message_type: Some(message_type.to_string()), sequence: None, accepted: true, code: None }
}

fn status_snapshot(ctx: &RouterContext) -> StatusPayload {
    StatusPayload {
        link_state: ctx.dispatcher.link_state(),
        session_count: ctx.connection_manager.client_count(),
        pending_commands: ctx.dispatcher.pending_commands(),
        hotspot: ctx.hotspot_status.latest().map(|status| status.to_payload()),
        uptime_seconds: ctx.started_at.elapsed().as_secs(),
    }
}

/// 处理从操作端接收到的单条消息。
pub async fn handle_message(session: &Arc<ClientSession>, message: WireMessage, ctx: &RouterContext) -> RouteOutcome {
    session.touch().await;
    debug!(
        "[MessageRouter] 会话 {}: 收到消息，类型: '{}'，关联 ID: {:?}",
        session.client_id, message.message_type, message.correlation_id
    );

    let command = match decode_client_command(&message) {
        Ok(command) => command,
        Err(e) => {
            warn!("[MessageRouter] 会话 {}: 无法处理的消息 '{}': {}", session.client_id, message.message_type, e);
            send_error_response(session, Some(&message.message_type), &e, message.correlation_id);
            return RouteOutcome::Terminate;
        }
    };
    let correlation_id = command.correlation_id;

    if command.kind.is_link_bound() {
        let message_type = command.kind.message_type();
        if let Err(e) = ctx.dispatcher.enqueue(command, Some(session.client_id)).await {
            debug!("[MessageRouter] 会话 {}: {} 命令被拒绝: {}", session.client_id, message_type, e);
            send_error_response(session, Some(message_type), &e, correlation_id);
        }
        return RouteOutcome::Continue;
    }

    match command.kind {
        CommandKind::Ping => reply(session, payloads::PONG_MESSAGE_TYPE, &EmptyPayload::default(), correlation_id),
        CommandKind::Status => {
            reply(session, payloads::STATUS_MESSAGE_TYPE, &status_snapshot(ctx), correlation_id);
        }
        CommandKind::Subscribe { topic } => {
            ctx.connection_manager.subscribe(&session.client_id, topic);
            reply(session, payloads::ACK_MESSAGE_TYPE, &local_ack(payloads::SUBSCRIBE_MESSAGE_TYPE), correlation_id);
        }
        CommandKind::Unsubscribe { topic } => {
            ctx.connection_manager.unsubscribe(&session.client_id, topic);
            reply(session, payloads::ACK_MESSAGE_TYPE, &local_ack(payloads::UNSUBSCRIBE_MESSAGE_TYPE), correlation_id);
        }
        other => {
            error!("[MessageRouter] 会话 {}: {} 没有本地处理分支", session.client_id, other.message_type());
        }
    }
    RouteOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::dispatcher::{BridgeDispatcher, DispatcherSettings};
    use common_models::enums::{GatewayErrorKind, LinkState, TelemetryTopic};
    use rust_link_utils::frame::frame_types;
    use rust_link_utils::link::memory::{ack_every_command, MemoryLink};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    async fn context(link: &MemoryLink) -> (RouterContext, watch::Sender<bool>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let connection_manager = Arc::new(ConnectionManager::new(8));
        let settings = DispatcherSettings {
            queue_capacity: 8,
            response_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
            keepalive_interval: None,
            drain_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            startup_retries: 1,
            write_failure_threshold: 3,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, _task) =
            BridgeDispatcher::start(Arc::new(link.clone()), settings, connection_manager.clone(), shutdown_rx)
                .await
                .expect("调度器启动失败");
        let ctx = RouterContext {
            connection_manager,
            dispatcher,
            hotspot_status: HotspotStatusCache::new(),
            started_at: Instant::now(),
        };
        (ctx, shutdown_tx)
    }

    fn request(message_type: &str, payload: serde_json::Value, correlation_id: u32) -> WireMessage {
        WireMessage::new(message_type, &payload).expect("创建消息失败").with_correlation_id(Some(correlation_id))
    }

    async fn next(session: &ClientSession) -> WireMessage {
        tokio::time::timeout(Duration::from_secs(2), session.outbound.pop())
            .await
            .expect("等待应答超时")
            .expect("会话意外关闭")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_and_status_are_answered_locally() {
        let link = MemoryLink::new();
        let (ctx, _shutdown) = context(&link).await;
        let session = ctx.connection_manager.add_client("127.0.0.1:7000".parse().expect("合法地址"));

        let outcome = handle_message(&session, request(payloads::PING_MESSAGE_TYPE, json!({}), 11), &ctx).await;
        assert_eq!(outcome, RouteOutcome::Continue);
        let pong = next(&session).await;
        assert_eq!(pong.message_type, payloads::PONG_MESSAGE_TYPE);
        assert_eq!(pong.correlation_id, Some(11));

        handle_message(&session, request(payloads::STATUS_REQUEST_MESSAGE_TYPE, json!({}), 12), &ctx).await;
        let status = next(&session).await;
        assert_eq!(status.correlation_id, Some(12));
        let payload: StatusPayload = status.deserialize_payload().expect("Status 负载解析失败");
        assert_eq!(payload.link_state, LinkState::Ready);
        assert_eq!(payload.session_count, 1);
        assert!(payload.hotspot.is_none());
        assert!(link.written_frames().is_empty(), "本地命令不应写串口");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_registers_topic_and_acks() {
        let link = MemoryLink::new();
        let (ctx, _shutdown) = context(&link).await;
        let session = ctx.connection_manager.add_client("127.0.0.1:7001".parse().expect("合法地址"));

        handle_message(&session, request(payloads::SUBSCRIBE_MESSAGE_TYPE, json!({"topic": "Rfid"}), 3), &ctx).await;
        let ack: AckPayload = next(&session).await.deserialize_payload().expect("Ack 负载解析失败");
        assert!(ack.accepted);
        assert_eq!(ack.sequence, None);
        assert!(session.is_subscribed(TelemetryTopic::Rfid));

        handle_message(&session, request(payloads::UNSUBSCRIBE_MESSAGE_TYPE, json!({"topic": "Rfid"}), 4), &ctx).await;
        next(&session).await;
        assert!(!session.is_subscribed(TelemetryTopic::Rfid));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_command_terminates_session() {
        let link = MemoryLink::new();
        let (ctx, _shutdown) = context(&link).await;
        let session = ctx.connection_manager.add_client("127.0.0.1:7002".parse().expect("合法地址"));

        let outcome = handle_message(
            &session,
            request(payloads::MOVE_MESSAGE_TYPE, json!({"direction": "Forward", "speed": 250}), 5),
            &ctx,
        )
        .await;
        assert_eq!(outcome, RouteOutcome::Terminate);
        let error = next(&session).await;
        assert_eq!(error.correlation_id, Some(5));
        let payload: ErrorResponsePayload = error.deserialize_payload().expect("错误负载解析失败");
        assert_eq!(payload.kind, GatewayErrorKind::MalformedCommand);
        assert_eq!(payload.original_message_type.as_deref(), Some("Move"));

        let outcome = handle_message(&session, request("Teleport", json!({}), 6), &ctx).await;
        assert_eq!(outcome, RouteOutcome::Terminate);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_link_command_is_written_and_acked() {
        let link = MemoryLink::new();
        link.set_responder(ack_every_command);
        let (ctx, _shutdown) = context(&link).await;
        let session = ctx.connection_manager.add_client("127.0.0.1:7003".parse().expect("合法地址"));

        let outcome = handle_message(
            &session,
            request(payloads::MOVE_MESSAGE_TYPE, json!({"direction": "Forward", "speed": 5}), 21),
            &ctx,
        )
        .await;
        assert_eq!(outcome, RouteOutcome::Continue);
        let ack = next(&session).await;
        assert_eq!(ack.message_type, payloads::ACK_MESSAGE_TYPE);
        assert_eq!(ack.correlation_id, Some(21));

        let written = link.written_frames();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].frame_type, frame_types::MOVE);
        assert_eq!(written[0].payload, vec![0x01, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    /// 原始帧透传属于下发命令，必须经过调度器写入串口并按序列号确认。
    async fn test_raw_passthrough_goes_through_dispatcher() {
        let link = MemoryLink::new();
        link.set_responder(ack_every_command);
        let (ctx, _shutdown) = context(&link).await;
        let session = ctx.connection_manager.add_client("127.0.0.1:7004".parse().expect("合法地址"));

        let outcome = handle_message(
            &session,
            request(payloads::RAW_FRAME_MESSAGE_TYPE, json!({"frame_type": 0x30, "data": [1, 2, 3]}), 31),
            &ctx,
        )
        .await;
        assert_eq!(outcome, RouteOutcome::Continue);
        let ack = next(&session).await;
        assert_eq!(ack.message_type, payloads::ACK_MESSAGE_TYPE);
        assert_eq!(ack.correlation_id, Some(31));
        let payload: AckPayload = ack.deserialize_payload().expect("Ack 负载解析失败");
        assert!(payload.sequence.is_some(), "经串口确认的 Ack 应带序列号");

        let written = link.written_frames();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].frame_type, 0x30);
        assert_eq!(written[0].payload, vec![1, 2, 3]);
    }
}
