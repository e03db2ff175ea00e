use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_api::create_app;
use orchestrator_core::ConfigHandle;
use orchestrator_dispatcher::Orchestrator;
use orchestrator_worker::{ExecutorRegistry, HttpCoreClient, ShellExecutor, WorkerRuntime};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 后台循环加HTTP API
    All,
    /// 只运行回收、分配和配置推送循环
    Core,
    /// 只提供HTTP API
    Api,
    /// 通过HTTP连接远程核心的Worker
    Worker,
}

impl AppMode {
    fn runs_loops(self) -> bool {
        matches!(self, AppMode::All | AppMode::Core)
    }

    fn serves_api(self) -> bool {
        matches!(self, AppMode::All | AppMode::Api)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(AppMode::All),
            "core" => Ok(AppMode::Core),
            "api" => Ok(AppMode::Api),
            "worker" => Ok(AppMode::Worker),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppMode::All => "all",
            AppMode::Core => "core",
            AppMode::Api => "api",
            AppMode::Worker => "worker",
        };
        f.write_str(name)
    }
}

/// 主应用程序
pub struct Application {
    config: ConfigHandle,
    mode: AppMode,
}

impl Application {
    pub fn new(config: ConfigHandle, mode: AppMode) -> Self {
        Self { config, mode }
    }

    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        info!("启动应用程序，模式: {}", self.mode);
        match self.mode {
            AppMode::Worker => self.run_worker(&shutdown).await,
            _ => self.run_core(&shutdown).await,
        }
    }

    async fn run_core(&self, shutdown: &ShutdownManager) -> Result<()> {
        let core = Arc::new(
            Orchestrator::start(self.config.clone())
                .await
                .context("启动编排核心失败")?,
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        if self.mode.runs_loops() {
            handles.extend(core.spawn_background(shutdown.sender()));
            // 启动期间已触发的关闭信号需要补发给刚订阅的循环
            if shutdown.is_shutdown() {
                let _ = shutdown.sender().send(());
            }
            info!("后台循环已启动: 回收、分配、配置推送");
        }

        let api_config = self.config.current().api.clone();
        let served = if self.mode.serves_api() && api_config.enabled {
            self.run_api(core.clone(), shutdown).await
        } else {
            if self.mode.serves_api() {
                warn!("API已在配置中禁用");
            }
            let _ = shutdown.subscribe().recv().await;
            Ok(())
        };
        if served.is_err() {
            shutdown.shutdown();
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {e}");
            }
        }
        core.shutdown().await;
        served
    }

    async fn run_api(&self, core: Arc<Orchestrator>, shutdown: &ShutdownManager) -> Result<()> {
        let api_config = self.config.current().api.clone();
        let app = create_app(core, &api_config);
        let listener = TcpListener::bind(&api_config.bind_address)
            .await
            .with_context(|| format!("绑定API地址失败: {}", api_config.bind_address))?;
        info!("API服务器监听: {}", api_config.bind_address);

        let mut shutdown_rx = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API服务器收到关闭信号");
            })
            .await
            .context("API服务器运行失败")?;
        info!("API服务器已停止");
        Ok(())
    }

    async fn run_worker(&self, shutdown: &ShutdownManager) -> Result<()> {
        let mut worker_config = self.config.current().worker.clone();
        let client = Arc::new(HttpCoreClient::new(worker_config.core_url.clone())?);

        let mut executors = ExecutorRegistry::new();
        executors.register("shell", Arc::new(ShellExecutor::new()));

        // 只声明本进程真正能执行的任务类型
        if worker_config.capabilities.iter().any(|c| c == "*") {
            worker_config.capabilities = executors.task_types();
        } else {
            worker_config.capabilities.retain(|c| {
                let supported = executors.get(c).is_some();
                if !supported {
                    warn!("能力 {} 没有对应的执行器，已忽略", c);
                }
                supported
            });
        }
        if worker_config.capabilities.is_empty() {
            return Err(anyhow::anyhow!("Worker没有可用的执行器"));
        }

        info!(
            "Worker连接编排核心: {}，能力: {:?}",
            worker_config.core_url, worker_config.capabilities
        );
        let runtime = WorkerRuntime::new(client, executors, worker_config);
        runtime
            .run(shutdown.subscribe())
            .await
            .context("Worker运行失败")?;
        info!("Worker服务已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_core_mode_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = orchestrator_core::AppConfig::default();
        config.database.url = format!("sqlite://{}", dir.path().join("app.db").display());
        let app = Application::new(ConfigHandle::fixed(config), AppMode::Core);
        let shutdown = ShutdownManager::new();

        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { app.run(shutdown).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown.shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(dir.path().join("app.db").exists());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("core".parse::<AppMode>().unwrap(), AppMode::Core);
        assert_eq!(AppMode::Worker.to_string(), "worker");
        assert!("dispatcher".parse::<AppMode>().is_err());
        assert!(AppMode::All.runs_loops() && AppMode::All.serves_api());
        assert!(!AppMode::Api.runs_loops());
        assert!(!AppMode::Core.serves_api());
    }
}
