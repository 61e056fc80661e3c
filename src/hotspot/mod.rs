//! Wi-Fi 热点管理。
//!
//! 网关所在的树莓派同时充当操作端接入用的 Wi-Fi 热点 (hostapd + dnsmasq)。
//! 本模块负责在启动时把热点拉起、周期性读取 DHCP 租约统计接入设备，并在退出时关闭热点。
//!
//! 所有操作都是阻塞的 (执行系统命令、读文件)，异步代码中应通过 `spawn_blocking` 调用。

pub mod monitor;
pub mod systemd;

pub use monitor::{HotspotMonitor, HotspotStatusCache};
pub use systemd::{CommandOutput, CommandRunner, SystemCommandRunner, SystemdHotspot};

use common_models::payloads::HotspotStatusPayload;
use log::info;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApError {
    #[error("执行命令 `{command}` 失败: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("命令 `{command}` 以状态 {code:?} 退出: {stderr}")]
    CommandFailed { command: String, code: Option<i32>, stderr: String },

    #[error("服务 {service} 未在运行 (当前状态: {state})")]
    ServiceInactive { service: String, state: String },

    #[error("读取租约文件 {path} 失败: {source}")]
    LeasesFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// DHCP 租约文件中的一条记录。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseEntry {
    pub mac: String,
    /// 客户端未上报主机名时为 `*`
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HotspotStatus {
    pub up: bool,
    pub ssid: String,
    pub client_count: usize,
    pub clients: Vec<LeaseEntry>,
}

impl HotspotStatus {
    pub fn to_payload(&self) -> HotspotStatusPayload {
        HotspotStatusPayload { up: self.up, ssid: self.ssid.clone(), client_count: self.client_count }
    }
}

pub trait HotspotManager: Send + Sync {
    /// 确保热点处于运行状态，必要时重启相关服务。
    fn ensure_access_point_up(&self) -> Result<(), ApError>;

    fn status(&self) -> Result<HotspotStatus, ApError>;

    fn disable(&self) -> Result<(), ApError>;
}

/// 配置中关闭热点管理时使用，不执行任何系统命令。
#[derive(Debug, Clone)]
pub struct DisabledHotspot {
    ssid: String,
}

impl DisabledHotspot {
    pub fn new(ssid: impl Into<String>) -> Self {
        DisabledHotspot { ssid: ssid.into() }
    }
}

impl HotspotManager for DisabledHotspot {
    fn ensure_access_point_up(&self) -> Result<(), ApError> {
        info!("[Hotspot] 热点管理已在配置中关闭，跳过启动");
        Ok(())
    }

    fn status(&self) -> Result<HotspotStatus, ApError> {
        Ok(HotspotStatus { up: false, ssid: self.ssid.clone(), client_count: 0, clients: Vec::new() })
    }

    fn disable(&self) -> Result<(), ApError> {
        Ok(())
    }
}

/// 解析 dnsmasq 租约文件：`<过期时间> <MAC> <IP> <主机名> <客户端 ID>`，每行一条。
pub fn parse_leases(contents: &str) -> Vec<LeaseEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let mac = fields.get(1)?;
            Some(LeaseEntry {
                mac: mac.to_lowercase(),
                hostname: fields.get(3).copied().unwrap_or("*").to_string(),
            })
        })
        .collect()
}
