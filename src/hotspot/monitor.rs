use super::{HotspotManager, HotspotStatus, LeaseEntry};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// 最近一次读取到的热点状态，供 `StatusRequest` 使用。
#[derive(Debug, Clone, Default)]
pub struct HotspotStatusCache {
    inner: Arc<RwLock<Option<HotspotStatus>>>,
}

impl HotspotStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, status: HotspotStatus) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    pub fn latest(&self) -> Option<HotspotStatus> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// 周期性读取热点状态，记录设备的接入与离开。
pub struct HotspotMonitor {
    manager: Arc<dyn HotspotManager>,
    cache: HotspotStatusCache,
    interval: Duration,
    known_clients: HashSet<String>,
}

impl HotspotMonitor {
    pub fn new(manager: Arc<dyn HotspotManager>, cache: HotspotStatusCache, interval: Duration) -> Self {
        info!("[HotspotMonitor] 创建热点监视器，检查周期: {:?}", interval);
        HotspotMonitor { manager, cache, interval, known_clients: HashSet::new() }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        info!("[HotspotMonitor] 热点监视器已停止");
    }

    /// 读取一次状态并更新缓存。读取失败时保留上一次的缓存。
    pub async fn poll_once(&mut self) -> Option<HotspotStatus> {
        let manager = Arc::clone(&self.manager);
        let status = match tokio::task::spawn_blocking(move || manager.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("[HotspotMonitor] 读取热点状态失败: {}", e);
                return None;
            }
            Err(e) => {
                error!("[HotspotMonitor] 读取热点状态的任务异常: {}", e);
                return None;
            }
        };

        let (joined, left) = diff_clients(&self.known_clients, &status.clients);
        for lease in &joined {
            info!("[HotspotMonitor] 设备接入热点: {} ({})", lease.mac, lease.hostname);
        }
        for mac in &left {
            info!("[HotspotMonitor] 设备离开热点: {}", mac);
        }
        self.known_clients = status.clients.iter().map(|lease| lease.mac.clone()).collect();
        debug!("[HotspotMonitor] 热点 {} up={}，接入设备 {} 台", status.ssid, status.up, status.client_count);

        self.cache.update(status.clone());
        Some(status)
    }
}

/// 返回 (新接入的租约, 已离开的 MAC)。
fn diff_clients(known: &HashSet<String>, current: &[LeaseEntry]) -> (Vec<LeaseEntry>, Vec<String>) {
    let current_macs: HashSet<&str> = current.iter().map(|lease| lease.mac.as_str()).collect();
    let joined = current.iter().filter(|lease| !known.contains(&lease.mac)).cloned().collect();
    let mut left: Vec<String> = known.iter().filter(|mac| !current_macs.contains(mac.as_str())).cloned().collect();
    left.sort();
    (joined, left)
}
