//! 等待下位机应答的命令表。
//!
//! 以下发帧的序列号为键。表项在收到 ACK/NACK、超时或链路断开时移除，
//! 移除后该序列号可以再次分配。

use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    /// 发起命令的会话
    pub origin: Uuid,
    pub correlation_id: u32,
    pub message_type: &'static str,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<u16, PendingCommand>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sequence: u16, command: PendingCommand) {
        self.entries.insert(sequence, command);
    }

    pub fn remove(&mut self, sequence: u16) -> Option<PendingCommand> {
        self.entries.remove(&sequence)
    }

    pub fn contains(&self, sequence: u16) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 取出所有截止时间不晚于 `now` 的表项，按序列号排序。
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u16, PendingCommand)> {
        let mut expired: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, command)| command.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|sequence| self.entries.remove(&sequence).map(|command| (sequence, command)))
            .collect()
    }

    /// 取出全部表项 (链路断开或关闭时)。
    pub fn drain_all(&mut self) -> Vec<(u16, PendingCommand)> {
        let mut all: Vec<(u16, PendingCommand)> = self.entries.drain().collect();
        all.sort_unstable_by_key(|(sequence, _)| *sequence);
        all
    }
}
