use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;

/// 持久化层熔断器配置，可热更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: usize,
    pub failure_window_seconds: u64,
    pub cooldown_seconds: u64,
    pub call_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_seconds: 60,
            cooldown_seconds: 30,
            call_timeout_ms: 10_000,
        }
    }
}

impl ResilienceConfig {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_seconds),
            recovery_timeout: Duration::from_secs(self.cooldown_seconds),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("熔断失败阈值必须大于0"));
        }
        if self.failure_window_seconds == 0 {
            return Err(anyhow::anyhow!("失败统计窗口必须大于0"));
        }
        if self.call_timeout_ms == 0 {
            return Err(anyhow::anyhow!("调用超时时间必须大于0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resilience_config_default() {
        let config = ResilienceConfig::default().breaker_config();

        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.failure_window, Duration::from_secs(60));
    }
}
