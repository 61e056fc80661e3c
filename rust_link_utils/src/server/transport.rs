// rust_link_utils/src/server/transport.rs

//! 服务端 TCP 监听和连接接受逻辑。

use crate::error::LinkUtilError;
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

/// 接受循环退出时仍在运行的连接任务。
///
/// 调用方通知各连接关闭之后，用 [`wait`](Self::wait) 等它们把剩余消息写完。
#[derive(Debug, Default)]
pub struct ConnectionTasks {
    tasks: JoinSet<()>,
}

impl ConnectionTasks {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 等待全部连接任务结束。超过 `timeout` 仍未结束的任务被中止，返回被中止的任务数。
    pub async fn wait(mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(result)) => log_task_result(result),
                Ok(None) => return 0,
                Err(_) => {
                    let remaining = self.tasks.len();
                    warn!("[ServerTransport] {} 个连接任务未能在 {:?} 内结束，强制中止", remaining, timeout);
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    return remaining;
                }
            }
        }
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("[ServerTransport] 连接任务 panic: {}", e);
        } else {
            debug!("[ServerTransport] 连接任务被取消: {}", e);
        }
    }
}

/// `ServerTransport` 负责监听地址并接受操作端连接。
///
/// 绑定 ([`bind`](Self::bind)) 与运行 ([`run`](Self::run)) 分成两步，
/// 这样调用方可以在启动阶段就发现端口占用等错误，并拿到实际监听的地址 (端口 0 时由系统分配)。
pub struct ServerTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ServerTransport {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, LinkUtilError> {
        let listener = TcpListener::bind(addr).await.map_err(LinkUtilError::TcpBindError)?;
        let local_addr = listener.local_addr().map_err(LinkUtilError::TcpBindError)?;
        info!("[ServerTransport] 正在监听地址: {}", local_addr);
        Ok(ServerTransport { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 运行接受循环，直到 `shutdown` 变为 `true` (或其发送端被丢弃)。
    ///
    /// 每个接入的连接都在新的 Tokio 任务中交给 `on_connect` 处理。
    /// 循环退出后不再接受新连接；仍在运行的连接任务作为 [`ConnectionTasks`] 返回，
    /// 由调用方通知它们关闭后再等待。
    pub async fn run<F, Fut>(self, mut shutdown: watch::Receiver<bool>, on_connect: F) -> Result<ConnectionTasks, LinkUtilError>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut connections = ConnectionTasks::default();
        if *shutdown.borrow() {
            return Ok(connections);
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[ServerTransport] 收到关闭信号，停止接受新连接 ({})", self.local_addr);
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, peer_addr)) => {
                            info!("[ServerTransport] 从 {} 接受了新的 TCP 连接", peer_addr);
                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                error!("[ServerTransport] 无法为 {} 设置 TCP_NODELAY: {}", peer_addr, e);
                            }
                            let on_connect_callback = on_connect.clone();
                            connections.tasks.spawn(async move {
                                on_connect_callback(tcp_stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            // 通常是文件描述符耗尽等暂时性问题，稍后继续
                            error!("[ServerTransport] 接受 TCP 连接失败: {}。服务器将继续运行。", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Some(finished) = connections.tasks.join_next(), if !connections.tasks.is_empty() => {
                    log_task_result(finished);
                }
            }
        }
        if !connections.is_empty() {
            info!("[ServerTransport] 停止接受时仍有 {} 个连接在运行", connections.len());
        }
        Ok(connections)
    }
}
