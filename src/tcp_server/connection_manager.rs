use crate::tcp_server::client_session::{ClientSession, PushOutcome, DEFAULT_CONTROL_CAPACITY};
use common_models::enums::TelemetryTopic;
use dashmap::DashMap;
use log::{debug, info, warn};
use rust_link_utils::message::WireMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// 会话注册表。
///
/// 每个操作都是单独原子的；跨多个会话的操作 (扇出、广播) 先取快照再逐个投递，
/// 投递时由会话缓冲区自身的关闭标记保证不会投递到已注销的会话。
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    pub clients: Arc<DashMap<Uuid, Arc<ClientSession>>>,
    telemetry_capacity: usize,
    control_capacity: usize,
}

impl ConnectionManager {
    pub fn new(telemetry_capacity: usize) -> Self {
        Self::with_capacities(telemetry_capacity, DEFAULT_CONTROL_CAPACITY)
    }

    /// `control_capacity`: 每个会话最多积压的控制消息条数，超出时会话被关闭。
    pub fn with_capacities(telemetry_capacity: usize, control_capacity: usize) -> Self {
        Self { clients: Arc::new(DashMap::new()), telemetry_capacity, control_capacity }
    }

    /// 为新连接创建会话并注册。
    pub fn add_client(&self, addr: SocketAddr) -> Arc<ClientSession> {
        let client_session = Arc::new(ClientSession::with_capacities(addr, self.telemetry_capacity, self.control_capacity));
        self.register(Arc::clone(&client_session));
        client_session
    }

    /// 注册会话。ID 已存在时返回 `false` 且不覆盖。
    pub fn register(&self, client_session: Arc<ClientSession>) -> bool {
        let client_id = client_session.client_id;
        match self.clients.entry(client_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("[ConnectionManager] 会话 {} 已注册，忽略重复注册", client_id);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!("[ConnectionManager] 新客户端连接成功: id={}, addr={}", client_id, client_session.addr);
                entry.insert(client_session);
                debug!("[ConnectionManager] 当前活动客户端总数: {}", self.clients.len());
                true
            }
        }
    }

    /// 注销会话并标记其关闭。第二次调用返回 `None`，不产生任何效果。
    pub fn unregister(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        match self.clients.remove(client_id) {
            Some((_id, session)) => {
                session.close();
                info!("[ConnectionManager] 客户端断开连接: id={}, addr={}", session.client_id, session.addr);
                debug!("[ConnectionManager] 移除后当前活动客户端总数: {}", self.clients.len());
                Some(session)
            }
            None => {
                debug!("[ConnectionManager] 会话 {} 已不在注册表中", client_id);
                None
            }
        }
    }

    pub fn get_client(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        self.clients.get(client_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_all_client_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.clients.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// 返回 `false` 表示会话不存在。
    pub fn subscribe(&self, client_id: &Uuid, topic: TelemetryTopic) -> bool {
        match self.clients.get(client_id) {
            Some(entry) => {
                if entry.value().subscribe(topic) {
                    debug!("[ConnectionManager] 会话 {} 订阅了主题 {}", client_id, topic);
                }
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, client_id: &Uuid, topic: TelemetryTopic) -> bool {
        match self.clients.get(client_id) {
            Some(entry) => {
                if entry.value().unsubscribe(topic) {
                    debug!("[ConnectionManager] 会话 {} 退订了主题 {}", client_id, topic);
                }
                true
            }
            None => false,
        }
    }

    pub fn sessions_subscribed_to(&self, topic: TelemetryTopic) -> Vec<Arc<ClientSession>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().is_subscribed(topic))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 向指定会话投递一条控制消息。会话不存在、已关闭或因积压被关闭时返回 `false`。
    pub fn send_to(&self, client_id: &Uuid, message: WireMessage) -> bool {
        match self.get_client(client_id) {
            Some(session) => session.push_control(message) == PushOutcome::Queued,
            None => {
                debug!(
                    "[ConnectionManager] 会话 {} 已离开，丢弃消息 (type: {})",
                    client_id, message.message_type
                );
                false
            }
        }
    }

    /// 把遥测扇出给所有订阅了该主题的会话，返回成功入队的会话数。从不等待。
    pub fn fan_out_telemetry(&self, topic: TelemetryTopic, message: &WireMessage) -> usize {
        let mut delivered = 0;
        for session in self.sessions_subscribed_to(topic) {
            match session.outbound.push_telemetry(message.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::QueuedDroppedOldest => {
                    delivered += 1;
                    debug!(
                        "[ConnectionManager] 会话 {} 发送缓冲区已满，丢弃最旧的遥测 (累计 {})",
                        session.client_id,
                        session.outbound.dropped_telemetry()
                    );
                }
                PushOutcome::Closed | PushOutcome::Overflow => {}
            }
        }
        delivered
    }

    /// 向所有会话投递一条控制消息。
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        self.get_all_client_sessions()
            .into_iter()
            .filter(|session| session.push_control(message.clone()) == PushOutcome::Queued)
            .count()
    }

    /// 注销全部会话 (进程关闭时)。
    pub fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.clients.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter(|id| self.unregister(id).is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().expect("合法地址")
    }

    fn message(tag: &str) -> WireMessage {
        WireMessage::new(tag, &json!({})).expect("创建消息失败")
    }

    #[test]
    fn test_unregister_twice_is_same_as_once() {
        let manager = ConnectionManager::new(4);
        let session = manager.add_client(addr());
        assert_eq!(manager.client_count(), 1);

        let removed = manager.unregister(&session.client_id).expect("第一次注销应当返回会话");
        assert_eq!(removed.client_id, session.client_id);
        assert!(removed.is_closed());
        assert!(manager.unregister(&session.client_id).is_none());
        assert_eq!(manager.client_count(), 0);
        assert!(manager.get_client(&session.client_id).is_none());
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let manager = ConnectionManager::new(4);
        let session = manager.add_client(addr());
        assert!(!manager.register(session.clone()));
        assert_eq!(manager.client_count(), 1);
    }

    #[test]
    fn test_fan_out_reaches_only_subscribers() {
        let manager = ConnectionManager::new(4);
        let battery_fan = manager.add_client(addr());
        let rfid_fan = manager.add_client(addr());
        assert!(manager.subscribe(&battery_fan.client_id, TelemetryTopic::Battery));
        assert!(manager.subscribe(&rfid_fan.client_id, TelemetryTopic::Rfid));
        assert!(!manager.subscribe(&Uuid::new_v4(), TelemetryTopic::Rfid));

        assert_eq!(manager.fan_out_telemetry(TelemetryTopic::Battery, &message("Telemetry")), 1);
        assert_eq!(battery_fan.outbound.len(), 1);
        assert!(rfid_fan.outbound.is_empty());

        assert!(manager.unsubscribe(&battery_fan.client_id, TelemetryTopic::Battery));
        assert_eq!(manager.fan_out_telemetry(TelemetryTopic::Battery, &message("Telemetry")), 0);
        assert_eq!(manager.sessions_subscribed_to(TelemetryTopic::Rfid).len(), 1);
    }

    #[test]
    /// 已注销的会话即使还被快照持有，也不会再收到消息。
    fn test_no_delivery_after_unregister() {
        let manager = ConnectionManager::new(4);
        let session = manager.add_client(addr());
        manager.subscribe(&session.client_id, TelemetryTopic::Battery);
        let snapshot = manager.sessions_subscribed_to(TelemetryTopic::Battery);

        manager.unregister(&session.client_id);
        for held in &snapshot {
            assert_eq!(held.outbound.push_telemetry(message("late")), PushOutcome::Closed);
        }
        assert!(!manager.send_to(&session.client_id, message("late")));
        assert_eq!(manager.broadcast(&message("late")), 0);
        assert!(session.outbound.is_empty());
    }

    #[test]
    /// 不读取的会话在积压超限后被关闭，其他会话照常收到广播。
    fn test_broadcast_closes_backlogged_session_only() {
        let manager = ConnectionManager::with_capacities(4, 2);
        let stalled = manager.add_client(addr());
        let healthy = manager.add_client(addr());
        assert!(manager.send_to(&stalled.client_id, message("Pong")));
        assert!(manager.send_to(&stalled.client_id, message("Pong")));

        assert_eq!(manager.broadcast(&message("LinkStatus")), 1);
        assert!(stalled.is_closed());
        assert!(!healthy.is_closed());
        assert_eq!(healthy.outbound.len(), 1);
        assert_eq!(stalled.outbound.len(), 3, "两条应答加一条溢出通知");
        assert!(!manager.send_to(&stalled.client_id, message("Pong")));
    }

    #[test]
    fn test_close_all_unregisters_everyone() {
        let manager = ConnectionManager::new(4);
        let sessions: Vec<_> = (0..3).map(|_| manager.add_client(addr())).collect();
        assert_eq!(manager.broadcast(&message("LinkStatus")), 3);
        assert_eq!(manager.close_all(), 3);
        assert_eq!(manager.client_count(), 0);
        assert!(sessions.iter().all(|s| s.is_closed()));
    }
}
