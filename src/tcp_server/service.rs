//! 操作端 TCP 服务：为每个连接创建会话、运行收发循环。
//!
//! 每个连接由两个任务处理：
//! - 接收循环 (本任务)：读取长度前缀帧，交给 [`message_router`] 处理；
//! - 发送任务：从会话的发送缓冲区取消息写回 TCP 连接。
//!
//! 会话被关闭 (心跳超时、应答积压、发送失败或超时、进程关闭) 时接收循环退出；
//! 发送任务写完缓冲区中剩余的消息后关闭写端。

use crate::error::{AppError, BridgeError};
use crate::tcp_server::client_session::ClientSession;
use crate::tcp_server::message_router::{self, build_message, send_error_response, RouteOutcome, RouterContext};
use common_models::payloads::{self, WelcomePayload};
use log::{debug, error, info, trace, warn};
use rust_link_utils::error::LinkUtilError;
use rust_link_utils::message::{receive_message, send_message, ClientFrameDecoder};
use rust_link_utils::server::transport::{ConnectionTasks, ServerTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// 接收循环结束后，等待发送任务写完剩余消息的最长时间。
pub const SENDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// 进程关闭时等待全部连接任务结束的最长时间，包含每个连接自身的发送任务收尾。
pub const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpService {
    context: Arc<RouterContext>,
    write_timeout: Duration,
}

impl TcpService {
    pub fn new(context: RouterContext) -> Self {
        info!("[TcpService] 创建 TCP 服务实例");
        Self { context: Arc::new(context), write_timeout: DEFAULT_WRITE_TIMEOUT }
    }

    /// 向客户端写一条消息的时限；超时说明对端已停止读取，会话被关闭。
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// 在已绑定的监听器上接受连接，直到 `shutdown` 变为 `true`。
    ///
    /// 返回时只是停止了接受新连接。已建立的会话需要调用方通过
    /// `ConnectionManager::close_all` 关闭，再等待返回的 [`ConnectionTasks`]。
    pub async fn run(self, transport: ServerTransport, shutdown: watch::Receiver<bool>) -> Result<ConnectionTasks, AppError> {
        info!("[TcpService] 开始在 {} 上接受操作端连接", transport.local_addr());
        let context = self.context;
        let write_timeout = self.write_timeout;
        transport
            .run(shutdown, move |tcp_stream, peer_addr| {
                let context = Arc::clone(&context);
                async move { handle_connection(tcp_stream, peer_addr, context, write_timeout).await }
            })
            .await
            .map_err(|e| AppError::TcpService(e.to_string()))
    }
}

/// 处理一个操作端连接，直到连接断开或会话被关闭。
pub async fn handle_connection(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<RouterContext>,
    write_timeout: Duration,
) {
    let session = context.connection_manager.add_client(peer_addr);
    let client_id = session.client_id;
    let (mut reader, writer) = tcp_stream.into_split();

    let welcome = WelcomePayload {
        session_id: client_id,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        link_state: context.dispatcher.link_state(),
    };
    if let Some(message) = build_message(payloads::WELCOME_MESSAGE_TYPE, &welcome, None) {
        session.push_control(message);
    }

    let mut sender_task = tokio::spawn(run_sender(Arc::clone(&session), writer, write_timeout));
    let mut decoder = ClientFrameDecoder::new();

    loop {
        let received = tokio::select! {
            _ = session.closed() => {
                debug!("[TcpService] 会话 {}: 收到关闭信号，结束接收循环", client_id);
                break;
            }
            received = receive_message(&mut reader, &mut decoder) => received,
        };
        match received {
            Some(Ok(message)) => {
                if message_router::handle_message(&session, message, &context).await == RouteOutcome::Terminate {
                    info!("[TcpService] 会话 {}: 收到无法处理的命令，关闭连接", client_id);
                    break;
                }
            }
            Some(Err(e @ (LinkUtilError::MalformedFrame(_) | LinkUtilError::DeserializationError(_)))) => {
                warn!("[TcpService] 会话 {}: 收到格式错误的帧: {}。关闭连接。", client_id, e);
                send_error_response(&session, None, &BridgeError::MalformedCommand(e.to_string()), None);
                break;
            }
            Some(Err(e)) => {
                info!("[TcpService] 会话 {}: 连接读取结束: {}", client_id, e);
                break;
            }
            None => {
                info!("[TcpService] 会话 {}: 客户端关闭了连接", client_id);
                break;
            }
        }
    }

    context.connection_manager.unregister(&client_id);
    match tokio::time::timeout(SENDER_FLUSH_TIMEOUT, &mut sender_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("[TcpService] 会话 {}: 发送任务异常结束: {}", client_id, e),
        Err(_) => {
            warn!("[TcpService] 会话 {}: 发送任务未能在 {:?} 内写完，强制结束", client_id, SENDER_FLUSH_TIMEOUT);
            sender_task.abort();
        }
    }
    info!("[TcpService] 会话 {} ({}) 的连接处理已结束", client_id, peer_addr);
}

async fn run_sender(session: Arc<ClientSession>, mut writer: OwnedWriteHalf, write_timeout: Duration) {
    let client_id = session.client_id;
    while let Some(message) = session.outbound.pop().await {
        trace!("[SenderTask {}] 发送消息: type={}", client_id, message.message_type);
        match tokio::time::timeout(write_timeout, send_message(&mut writer, &message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[SenderTask {}] 发送失败，连接可能已断开: {}", client_id, e);
                session.close();
                break;
            }
            Err(_) => {
                warn!("[SenderTask {}] 客户端在 {:?} 内没有读取数据，关闭会话", client_id, write_timeout);
                session.close();
                // 写端可能卡在半帧上，不再尝试正常关闭
                return;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("[SenderTask {}] 关闭写端失败: {}", client_id, e);
    }
    debug!("[SenderTask {}] 发送任务结束", client_id);
}
