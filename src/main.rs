use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use orchestrator::{AppMode, Application, ShutdownManager};
use orchestrator_core::{init_logging, AppConfig, ConfigHandle};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("orchestrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("多智能体编排核心")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认位置查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["all", "core", "api", "worker"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("watch-config")
                .long("watch-config")
                .help("配置文件变化时自动重新加载")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").cloned();
    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all")
        .parse()?;

    let config = AppConfig::load(config_path.as_deref())
        .with_context(|| format!("加载配置失败: {}", config_path.as_deref().unwrap_or("<默认位置>")))?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = matches
        .get_one::<String>("log-format")
        .cloned()
        .unwrap_or_else(|| config.observability.log_format.clone());
    init_logging(&log_level, &log_format)?;

    info!("启动编排核心，模式: {}", mode);
    if let Some(path) = &config_path {
        info!("配置文件: {}", path);
    }

    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address)?;
    }

    let handle = ConfigHandle::new(config, config_path.map(PathBuf::from));
    let _watcher = if matches.get_flag("watch-config") {
        match handle.watch_file() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("无法监听配置文件: {}", e);
                None
            }
        }
    } else {
        None
    };

    let shutdown_manager = ShutdownManager::new();
    let app = Application::new(handle, mode);
    let app_handle = {
        let shutdown = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown.clone()).await {
                error!("应用运行失败: {e:#}");
                shutdown.shutdown();
            }
        })
    };

    let mut stopped = shutdown_manager.subscribe();
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown();
        }
        _ = stopped.recv() => {}
    }

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("编排核心已退出");
    Ok(())
}

/// 安装 Prometheus 指标导出器
fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("指标监听地址无效: {bind_address}"))?;
    let (recorder, exporter) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .map_err(|e| anyhow::anyhow!("创建Prometheus导出器失败: {}", e))?;
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("安装指标记录器失败: {}", e))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            error!("Prometheus导出器退出: {:?}", e);
        }
    });

    info!("Prometheus指标导出器监听: {}", addr);
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
