//! 网关配置模块。
//!
//! 配置以 JSON 文件保存 (默认为当前目录下的 `gateway_settings.json`)：
//! - 文件不存在时使用默认配置，并把默认配置写回该路径，方便现场修改；
//! - 文件损坏 (无法反序列化) 时记录警告，使用默认配置并覆盖原文件；
//! - 文件中缺少的字段取默认值，因此旧版本的配置文件可以继续使用。
//!
//! 配置在 `main` 中加载一次，然后以值的形式传入各个组件的构造函数。

use crate::error::AppError;
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "gateway_settings.json";

/// 操作端 TCP 服务配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 绑定的主机地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 心跳检查的间隔时间（单位：秒）
    pub heartbeat_check_interval_seconds: u64,
    /// 客户端超时时间（单位：秒），超过这么久没有收到任何消息的会话会被移除
    pub client_timeout_seconds: u64,
    /// 每个会话最多缓存的遥测消息条数，超出时丢弃最旧的一条
    pub client_buffer_capacity: usize,
    /// 每个会话最多积压的应答/错误/状态消息条数，超出时会话被关闭
    pub client_control_capacity: usize,
    /// 向客户端写一条消息允许的最长时间（单位：秒），超时的会话被关闭
    pub client_write_timeout_seconds: u64,
    /// 发往下位机的命令队列容量
    pub inbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            heartbeat_check_interval_seconds: 15,
            client_timeout_seconds: 60,
            client_buffer_capacity: 64,
            client_control_capacity: 256,
            client_write_timeout_seconds: 10,
            inbound_queue_capacity: 128,
        }
    }
}

/// 串口链路配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub device_path: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// 重连退避的初始间隔，每次失败翻倍
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 启动时打开串口的最大尝试次数
    pub startup_retries: u32,
    /// 连续写失败达到该次数后判定链路断开
    pub write_failure_threshold: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/serial0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 50,
            write_timeout_ms: 500,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            startup_retries: 5,
            write_failure_threshold: 3,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// 桥接调度器配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// 带关联 ID 的命令等待下位机应答的时限
    pub response_timeout_ms: u64,
    /// 待应答表的扫描周期
    pub poll_interval_ms: u64,
    /// 链路空闲多久后发送保活帧，0 表示不发送
    pub keepalive_interval_ms: u64,
    /// 关闭时排空命令队列的最长时间
    pub drain_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1_000,
            poll_interval_ms: 100,
            keepalive_interval_ms: 2_000,
            drain_timeout_ms: 2_000,
        }
    }
}

/// Wi-Fi 热点配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HotspotConfig {
    /// 为 false 时不触碰系统网络服务
    pub enabled: bool,
    pub ssid: String,
    pub interface: String,
    /// dnsmasq 的 DHCP 租约文件
    pub leases_file: String,
    /// 按顺序重启的系统服务
    pub services: Vec<String>,
    pub monitor_interval_seconds: u64,
    /// 执行系统命令时是否加 `sudo`
    pub use_sudo: bool,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ssid: "robot-gateway".to_string(),
            interface: "wlan0".to_string(),
            leases_file: "/var/lib/misc/dnsmasq.leases".to_string(),
            services: vec!["hostapd".to_string(), "dnsmasq".to_string(), "systemd-networkd".to_string()],
            monitor_interval_seconds: 10,
            use_sudo: true,
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub serial: SerialConfig,
    pub bridge: BridgeConfig,
    pub hotspot: HotspotConfig,
    /// `env_logger` 过滤表达式，环境变量 `RUST_LOG` 优先
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
            bridge: BridgeConfig::default(),
            hotspot: HotspotConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 检查会导致运行时 panic 或无意义行为的取值。
    pub fn validate(&self) -> Result<(), AppError> {
        let checks: [(bool, &str); 9] = [
            (self.server.heartbeat_check_interval_seconds > 0, "server.heartbeat_check_interval_seconds 必须大于 0"),
            (self.server.client_buffer_capacity > 0, "server.client_buffer_capacity 必须大于 0"),
            (self.server.client_control_capacity > 0, "server.client_control_capacity 必须大于 0"),
            (self.server.client_write_timeout_seconds > 0, "server.client_write_timeout_seconds 必须大于 0"),
            (self.server.inbound_queue_capacity > 0, "server.inbound_queue_capacity 必须大于 0"),
            (self.serial.write_failure_threshold > 0, "serial.write_failure_threshold 必须大于 0"),
            (self.serial.initial_backoff_ms > 0, "serial.initial_backoff_ms 必须大于 0"),
            (self.bridge.poll_interval_ms > 0, "bridge.poll_interval_ms 必须大于 0"),
            (self.hotspot.monitor_interval_seconds > 0, "hotspot.monitor_interval_seconds 必须大于 0"),
        ];
        for (ok, message) in checks {
            if !ok {
                return Err(AppError::ConfigError(message.to_string()));
            }
        }
        if self.serial.max_backoff_ms < self.serial.initial_backoff_ms {
            return Err(AppError::ConfigError(
                "serial.max_backoff_ms 不能小于 serial.initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// 网关命令行参数。配置文件路径可以用 `--config <path>` 或唯一的位置参数给出。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// 配置文件路径 (JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE_NAME)]
    pub config: PathBuf,

    /// 配置文件路径，与 `--config` 二选一
    #[arg(value_name = "CONFIG_PATH", conflicts_with = "config")]
    pub config_path: Option<PathBuf>,
}

impl Cli {
    pub fn resolved_config_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(|| self.config.clone())
    }
}

/// 加载配置文件；文件缺失或损坏时使用默认配置并写回。
pub fn load_or_create_config(config_file_path: &Path) -> AppConfig {
    match fs::read_to_string(config_file_path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("[配置模块] 已成功从配置文件 {:?} 加载应用配置。", config_file_path);
                config
            }
            Err(e) => {
                warn!(
                    "[配置模块] 警告：从 {:?} 反序列化配置失败: {}. 文件可能已损坏。将使用默认配置并尝试覆盖。",
                    config_file_path, e
                );
                let default_config = AppConfig::default();
                save_config(&default_config, config_file_path);
                default_config
            }
        },
        Err(e) => {
            info!(
                "[配置模块] 未在 {:?} 找到配置文件或读取时发生错误 (错误: {}). 将使用默认配置并尝试创建新文件。",
                config_file_path, e
            );
            let default_config = AppConfig::default();
            save_config(&default_config, config_file_path);
            default_config
        }
    }
}

/// 保存配置到文件，失败时只记录警告。
pub fn save_config(config: &AppConfig, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("[配置模块] 错误：创建配置目录 {:?} 失败: {}", parent, e);
                return;
            }
        }
    }

    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 错误：将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已将当前配置保存到 {:?}.", path);
            }
        }
        Err(e) => {
            warn!("[配置模块] 错误：序列化配置信息以便保存时失败: {}", e);
        }
    }
}
