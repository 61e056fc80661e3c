use anyhow::Context;
use env_logger::Env;
use log::{error, info, warn};
use robot_gateway::bridge::dispatcher::{BridgeDispatcher, DispatcherSettings};
use clap::Parser;
use robot_gateway::config::{load_or_create_config, Cli};
use robot_gateway::error::AppError;
use robot_gateway::hotspot::{ApError, DisabledHotspot, HotspotManager, HotspotMonitor, HotspotStatusCache, SystemdHotspot};
use robot_gateway::tcp_server::connection_manager::ConnectionManager;
use robot_gateway::tcp_server::heartbeat_monitor::HeartbeatMonitor;
use robot_gateway::tcp_server::message_router::RouterContext;
use robot_gateway::tcp_server::service::{TcpService, CONNECTION_SHUTDOWN_TIMEOUT};
use rust_link_utils::link::serial::SerialLinkOpener;
use rust_link_utils::server::transport::ServerTransport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// 在阻塞线程池上执行一次热点操作。
async fn call_hotspot<T, F>(hotspot: &Arc<dyn HotspotManager>, operation: F) -> anyhow::Result<T>
where
    F: FnOnce(&dyn HotspotManager) -> Result<T, ApError> + Send + 'static,
    T: Send + 'static,
{
    let hotspot = Arc::clone(hotspot);
    let result = tokio::task::spawn_blocking(move || operation(&*hotspot))
        .await
        .context("热点操作任务异常终止")?;
    result.map_err(|e| AppError::from(e).into())
}

/// 等待 Ctrl-C 或 SIGTERM (systemd 停止服务时发送)。
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => info!("[主程序] 收到 Ctrl-C"),
                        Err(e) => error!("[主程序] 监听 Ctrl-C 失败: {}", e),
                    },
                    _ = terminate.recv() => info!("[主程序] 收到 SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("[主程序] 无法注册 SIGTERM 处理: {}", e),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("[主程序] 收到 Ctrl-C"),
        Err(e) => error!("[主程序] 监听 Ctrl-C 失败: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Cli::parse().resolved_config_path();
    let config = load_or_create_config(&config_path);

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level.as_str()))
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已初始化 (env_logger)，配置文件: {:?}", config_path);
    config.validate()?;

    let started_at = Instant::now();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let transport = ServerTransport::bind(bind_addr.as_str())
        .await
        .map_err(|e| AppError::TcpService(format!("无法监听 {}: {}", bind_addr, e)))?;

    let hotspot: Arc<dyn HotspotManager> = if config.hotspot.enabled {
        Arc::new(SystemdHotspot::new(config.hotspot.clone()))
    } else {
        Arc::new(DisabledHotspot::new(config.hotspot.ssid.clone()))
    };
    call_hotspot(&hotspot, |hotspot| hotspot.ensure_access_point_up()).await?;

    let connection_manager = Arc::new(ConnectionManager::with_capacities(
        config.server.client_buffer_capacity,
        config.server.client_control_capacity,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let opener = Arc::new(SerialLinkOpener::new(
        config.serial.device_path.clone(),
        config.serial.baud_rate,
        config.serial.read_timeout(),
        config.serial.write_timeout(),
    ));
    let (dispatcher, dispatcher_task) = match BridgeDispatcher::start(
        opener,
        DispatcherSettings::from_config(&config),
        Arc::clone(&connection_manager),
        shutdown_rx.clone(),
    )
    .await
    {
        Ok(started) => started,
        Err(e) => {
            error!("[主程序] 致命错误：无法打开串口 {}: {}", config.serial.device_path, e);
            if let Err(disable_error) = call_hotspot(&hotspot, |hotspot| hotspot.disable()).await {
                warn!("[主程序] 关闭热点失败: {}", disable_error);
            }
            return Err(AppError::SerialLink(e.to_string()).into());
        }
    };

    let hotspot_status = HotspotStatusCache::new();
    let hotspot_monitor = HotspotMonitor::new(
        Arc::clone(&hotspot),
        hotspot_status.clone(),
        Duration::from_secs(config.hotspot.monitor_interval_seconds),
    );
    let hotspot_monitor_task = tokio::spawn(hotspot_monitor.run(shutdown_rx.clone()));

    let heartbeat_monitor = HeartbeatMonitor::new(
        Arc::clone(&connection_manager),
        Duration::from_secs(config.server.client_timeout_seconds),
        Duration::from_secs(config.server.heartbeat_check_interval_seconds),
    );
    let heartbeat_task = tokio::spawn(heartbeat_monitor.run(shutdown_rx.clone()));

    let context = RouterContext {
        connection_manager: Arc::clone(&connection_manager),
        dispatcher,
        hotspot_status,
        started_at,
    };
    let service = TcpService::new(context)
        .with_write_timeout(Duration::from_secs(config.server.client_write_timeout_seconds));
    let service_task = tokio::spawn(service.run(transport, shutdown_rx));
    info!(
        "[主程序] 网关已启动：操作端地址 {}，串口 {}@{}",
        bind_addr, config.serial.device_path, config.serial.baud_rate
    );

    wait_for_shutdown_signal().await;
    info!("[主程序] 开始关闭流程...");
    shutdown_tx.send_replace(true);

    let connections = match service_task.await {
        Ok(Ok(connections)) => {
            info!("[主程序] 已停止接受新连接");
            Some(connections)
        }
        Ok(Err(e)) => {
            error!("[主程序] TCP 服务异常结束: {}", e);
            None
        }
        Err(e) => {
            error!("[主程序] TCP 服务任务异常终止: {}", e);
            None
        }
    };
    if let Err(e) = dispatcher_task.await {
        error!("[主程序] 调度任务异常终止: {}", e);
    }
    let closed = connection_manager.close_all();
    info!("[主程序] 已关闭 {} 个操作端会话", closed);
    if let Some(connections) = connections {
        let aborted = connections.wait(CONNECTION_SHUTDOWN_TIMEOUT).await;
        if aborted > 0 {
            warn!("[主程序] {} 个连接未能写完剩余消息", aborted);
        }
    }
    if let Err(e) = heartbeat_task.await {
        warn!("[主程序] 心跳监视任务异常终止: {}", e);
    }
    if let Err(e) = hotspot_monitor_task.await {
        warn!("[主程序] 热点监视任务异常终止: {}", e);
    }
    if let Err(e) = call_hotspot(&hotspot, |hotspot| hotspot.disable()).await {
        warn!("[主程序] 关闭热点失败: {}", e);
    }

    info!("[主程序] 网关已退出");
    Ok(())
}
