use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// 连接池耗尽时的最长等待
    pub acquire_timeout_ms: u64,
    pub idle_timeout_seconds: u64,
    /// 条件更新遇到写锁时的最长等待
    pub busy_timeout_ms: u64,
    /// 每个连接缓存的预编译语句数量
    pub statement_cache_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://orchestrator.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_ms: 5_000,
            idle_timeout_seconds: 600,
            busy_timeout_ms: 2_000,
            statement_cache_capacity: 100,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Validate database configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是SQLite格式"));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        if self.acquire_timeout_ms == 0 {
            return Err(anyhow::anyhow!("连接获取超时时间必须大于0"));
        }

        if self.busy_timeout_ms == 0 {
            return Err(anyhow::anyhow!("锁等待超时时间必须大于0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_validation() {
        let mut config = DatabaseConfig::default();
        assert!(config.validate().is_ok());

        config.url = "postgres://localhost/db".to_string();
        assert!(config.validate().is_err());

        config = DatabaseConfig {
            min_connections: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
