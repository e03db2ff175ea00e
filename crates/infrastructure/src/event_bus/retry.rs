use std::time::Duration;

use orchestrator_core::config::models::EventBusConfig;
use rand::Rng;

/// 处理器失败后的重试策略：指数退避，可选抖动
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EventBusConfig) -> Self {
        Self {
            max_retries: config.max_handler_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: config.retry_jitter,
        }
    }

    /// 第 `attempt` 次重试前的等待时间，从 0 开始计数
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        // 在 [delay/2, delay] 之间取值
        let half = delay / 2;
        let spread = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}
