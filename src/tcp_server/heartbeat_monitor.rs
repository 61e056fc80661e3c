//! 心跳监视器模块。
//!
//! 定期检查所有会话的 `last_seen`，超过超时阈值没有收到任何消息 (包括 `Ping`) 的会话
//! 会被注销。注销会关闭会话，其连接处理任务随之退出并关闭 TCP 连接。

use crate::tcp_server::connection_manager::ConnectionManager;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub struct HeartbeatMonitor {
    connection_manager: Arc<ConnectionManager>,
    /// 会话允许的最大不活动时间
    client_timeout_duration: Duration,
    check_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(connection_manager: Arc<ConnectionManager>, client_timeout_duration: Duration, check_interval: Duration) -> Self {
        info!(
            "[心跳监视器] 创建 HeartbeatMonitor。客户端超时阈值: {:?}，检查周期: {:?}",
            client_timeout_duration, check_interval
        );
        Self { connection_manager, client_timeout_duration, check_interval }
    }

    /// 按检查周期运行，直到 `shutdown` 变为 `true`。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("[心跳监视器] 后台检查循环已启动，周期: {:?}", self.check_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.check_interval) => {
                    self.check_for_timed_out_clients().await;
                }
            }
        }
        info!("[心跳监视器] 已停止");
    }

    /// 注销所有超时的会话，返回被注销的会话 ID。
    pub async fn check_for_timed_out_clients(&self) -> Vec<Uuid> {
        let clients_snapshot = self.connection_manager.get_all_client_sessions();
        if clients_snapshot.is_empty() {
            debug!("[心跳监视器] 当前没有活动的客户端连接，无需检查。");
            return Vec::new();
        }

        let chrono_timeout_threshold = match chrono::Duration::from_std(self.client_timeout_duration) {
            Ok(duration) => duration,
            Err(e) => {
                warn!(
                    "[心跳监视器] 无法转换 client_timeout_duration ({:?}): {}。使用默认值 60 秒。",
                    self.client_timeout_duration, e
                );
                chrono::Duration::seconds(60)
            }
        };

        let now = Utc::now();
        let mut timed_out = Vec::new();
        for client_session in &clients_snapshot {
            let last_seen = *client_session.last_seen.read().await;
            if now.signed_duration_since(last_seen) > chrono_timeout_threshold {
                warn!(
                    "[心跳监视器] 客户端 {} (ID: {}) 已超时。最后活跃: {}，超时阈值: {:?}。正在移除...",
                    client_session.addr,
                    client_session.client_id,
                    last_seen.to_rfc3339(),
                    self.client_timeout_duration
                );
                if self.connection_manager.unregister(&client_session.client_id).is_some() {
                    timed_out.push(client_session.client_id);
                }
            } else {
                debug!(
                    "[心跳监视器] 客户端 {} (ID: {}) 仍然活跃，最后活跃: {}",
                    client_session.addr,
                    client_session.client_id,
                    last_seen.to_rfc3339()
                );
            }
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_session_is_removed_and_active_one_kept() {
        let _ = env_logger::builder().is_test(true).try_init();
        let manager = Arc::new(ConnectionManager::new(4));
        let idle = manager.add_client("127.0.0.1:8001".parse().expect("合法地址"));
        let active = manager.add_client("127.0.0.1:8002".parse().expect("合法地址"));
        *idle.last_seen.write().await = Utc::now() - chrono::Duration::seconds(120);

        let monitor = HeartbeatMonitor::new(manager.clone(), Duration::from_secs(60), Duration::from_secs(1));
        let removed = monitor.check_for_timed_out_clients().await;

        assert_eq!(removed, vec![idle.client_id]);
        assert!(idle.is_closed());
        assert!(!active.is_closed());
        assert_eq!(manager.client_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_touch_keeps_session_alive() {
        let manager = Arc::new(ConnectionManager::new(4));
        let session = manager.add_client("127.0.0.1:8003".parse().expect("合法地址"));
        *session.last_seen.write().await = Utc::now() - chrono::Duration::seconds(120);
        session.touch().await;

        let monitor = HeartbeatMonitor::new(manager.clone(), Duration::from_secs(60), Duration::from_secs(1));
        assert!(monitor.check_for_timed_out_clients().await.is_empty());
        assert_eq!(manager.client_count(), 1);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let manager = Arc::new(ConnectionManager::new(4));
        let monitor = HeartbeatMonitor::new(manager, Duration::from_secs(60), Duration::from_millis(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(shutdown_rx));
        shutdown_tx.send(true).expect("发送关闭信号失败");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("心跳监视器没有停止")
            .expect("任务 panic");
    }
}
