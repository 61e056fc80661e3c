//! 基于 systemd 服务 (hostapd / dnsmasq / systemd-networkd) 的热点管理。

use super::{parse_leases, ApError, HotspotManager, HotspotStatus};
use crate::config::HotspotConfig;
use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// 执行外部命令的接口，测试中用记录型实现替换。
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApError> {
        let output = Command::new(program).args(args).output().map_err(|source| ApError::Io {
            command: command_line(program, args),
            source,
        })?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ")
}

const ACCESS_POINT_SERVICE: &str = "hostapd";

pub struct SystemdHotspot<R: CommandRunner = SystemCommandRunner> {
    config: HotspotConfig,
    runner: R,
}

impl SystemdHotspot<SystemCommandRunner> {
    pub fn new(config: HotspotConfig) -> Self {
        Self::with_runner(config, SystemCommandRunner)
    }
}

impl<R: CommandRunner> SystemdHotspot<R> {
    pub fn with_runner(config: HotspotConfig, runner: R) -> Self {
        SystemdHotspot { config, runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApError> {
        if self.config.use_sudo {
            let mut sudo_args = Vec::with_capacity(args.len() + 1);
            sudo_args.push(program);
            sudo_args.extend_from_slice(args);
            self.runner.run("sudo", &sudo_args)
        } else {
            self.runner.run(program, args)
        }
    }

    fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ApError> {
        let output = self.run(program, args)?;
        if !output.success {
            return Err(ApError::CommandFailed {
                command: command_line(program, args),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// 中间步骤失败只记录，不打断启动流程；最终以 hostapd 的状态为准。
    fn run_logged(&self, program: &str, args: &[&str]) {
        match self.run_checked(program, args) {
            Ok(_) => debug!("[Hotspot] 已执行: {}", command_line(program, args)),
            Err(e) => warn!("[Hotspot] {}", e),
        }
    }

    fn service_state(&self, service: &str) -> Result<String, ApError> {
        // is-active 对非运行状态返回非零退出码，这里只看输出
        let output = self.run("systemctl", &["is-active", service])?;
        let state = output.stdout.trim();
        Ok(if state.is_empty() { "unknown".to_string() } else { state.to_string() })
    }

    fn clear_stale_leases(&self) {
        if Path::new(&self.config.leases_file).exists() {
            self.run_logged("truncate", &["-s", "0", &self.config.leases_file]);
        }
    }
}

impl<R: CommandRunner> HotspotManager for SystemdHotspot<R> {
    fn ensure_access_point_up(&self) -> Result<(), ApError> {
        let interface = self.config.interface.as_str();
        info!("[Hotspot] 正在启动热点 {} (接口 {})", self.config.ssid, interface);

        self.clear_stale_leases();
        self.run_logged("ip", &["link", "set", interface, "down"]);
        match self.run("iwconfig", &[interface]) {
            Ok(output) if output.stdout.contains("Mode:Master") => {
                debug!("[Hotspot] 接口 {} 已处于 Master 模式", interface);
            }
            Ok(_) => self.run_logged("ip", &["link", "set", interface, "up"]),
            Err(e) => {
                warn!("[Hotspot] 无法查询接口 {} 的无线模式: {}", interface, e);
                self.run_logged("ip", &["link", "set", interface, "up"]);
            }
        }
        for service in &self.config.services {
            self.run_logged("systemctl", &["restart", service]);
        }

        let state = self.service_state(ACCESS_POINT_SERVICE)?;
        if state != "active" {
            warn!("[Hotspot] {} 状态为 {}，热点启动失败，关闭相关服务", ACCESS_POINT_SERVICE, state);
            if let Err(e) = self.disable() {
                warn!("[Hotspot] 关闭热点服务失败: {}", e);
            }
            return Err(ApError::ServiceInactive { service: ACCESS_POINT_SERVICE.to_string(), state });
        }
        info!("[Hotspot] 热点 {} 已就绪", self.config.ssid);
        Ok(())
    }

    fn status(&self) -> Result<HotspotStatus, ApError> {
        let up = self.service_state(ACCESS_POINT_SERVICE)? == "active";
        let clients = match fs::read_to_string(&self.config.leases_file) {
            Ok(contents) => parse_leases(&contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(ApError::LeasesFile { path: self.config.leases_file.clone(), source });
            }
        };
        Ok(HotspotStatus { up, ssid: self.config.ssid.clone(), client_count: clients.len(), clients })
    }

    /// 按与启动相反的顺序停止服务。全部尝试一遍，返回遇到的第一个错误。
    fn disable(&self) -> Result<(), ApError> {
        info!("[Hotspot] 正在关闭热点 {}", self.config.ssid);
        let mut first_error = None;
        for service in self.config.services.iter().rev() {
            if let Err(e) = self.run_checked("systemctl", &["stop", service]) {
                warn!("[Hotspot] {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
