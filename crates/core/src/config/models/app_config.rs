use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    database::DatabaseConfig,
    resilience::ResilienceConfig,
    runtime::{EngineConfig, EventBusConfig, RegistryConfig, WorkerRuntimeConfig},
};

/// 环境变量前缀，层级分隔符为 `__`，如 `ORCHESTRATOR__DATABASE__URL`
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub resilience: ResilienceConfig,
    pub engine: EngineConfig,
    pub event_bus: EventBusConfig,
    pub registry: RegistryConfig,
    pub worker: WorkerRuntimeConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: ORCHESTRATOR__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/orchestrator.toml",
                "orchestrator.toml",
                "/etc/orchestrator/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("worker.capabilities"),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.resilience.validate().context("熔断器配置验证失败")?;
        self.engine.validate().context("任务引擎配置验证失败")?;
        self.event_bus.validate().context("事件总线配置验证失败")?;
        self.registry.validate().context("注册中心配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }

    /// 与 `other` 相比，只能在重启后生效的变更项
    pub fn restart_required_changes(&self, other: &AppConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.database != other.database {
            changed.push("database");
        }
        if self.event_bus.queue_capacity != other.event_bus.queue_capacity {
            changed.push("event_bus.queue_capacity");
        }
        if self.event_bus.replay_capacity != other.event_bus.replay_capacity {
            changed.push("event_bus.replay_capacity");
        }
        if self.event_bus.dispatch_workers != other.event_bus.dispatch_workers {
            changed.push("event_bus.dispatch_workers");
        }
        if self.event_bus.durable_log != other.event_bus.durable_log {
            changed.push("event_bus.durable_log");
        }
        if self.api != other.api {
            changed.push("api");
        }
        if self.observability != other.observability {
            changed.push("observability");
        }
        changed
    }

    /// 用 `current` 中不可热更新的部分覆盖自身
    pub fn retain_restart_only(mut self, current: &AppConfig) -> Self {
        self.database = current.database.clone();
        self.event_bus.queue_capacity = current.event_bus.queue_capacity;
        self.event_bus.replay_capacity = current.event_bus.replay_capacity;
        self.event_bus.dispatch_workers = current.event_bus.dispatch_workers;
        self.event_bus.durable_log = current.event_bus.durable_log;
        self.api = current.api.clone();
        self.observability = current.observability.clone();
        self
    }
}
