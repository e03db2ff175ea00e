use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{OrchestratorError, OrchestratorResult};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常放行
    Closed,
    /// 快速失败
    Open,
    /// 冷却结束，只放行一个探测调用
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// 滚动窗口内的失败次数阈值
    pub failure_threshold: usize,
    /// 失败计数的滚动窗口
    pub failure_window: Duration,
    /// 打开后的冷却时间
    pub recovery_timeout: Duration,
    /// 单次调用超时
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// 熔断器对外可见的统计快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    /// 窗口内的失败次数
    pub failure_count: usize,
    /// 距离打开已过去的毫秒数
    pub open_for_ms: Option<u64>,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
    total_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    times_opened: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_started_at: None,
            total_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            times_opened: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_started_at = None;
        self.failures.clear();
        self.times_opened += 1;
        metrics::counter!("orchestrator_circuit_breaker_opened_total").increment(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// 熔断器：保护持久化层，防止故障级联
///
/// 只有瞬时错误（超时、连接重置、数据库繁忙）计入失败；约束冲突等
/// 业务错误说明存储本身是健康的，按成功处理。
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<RwLock<CircuitBreakerConfig>>,
    inner: Arc<RwLock<BreakerInner>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            inner: Arc::new(RwLock::new(BreakerInner::new())),
        }
    }

    /// 热更新阈值与冷却时间，当前状态保持不变
    pub async fn update_config(&self, config: CircuitBreakerConfig) {
        let mut current = self.config.write().await;
        if *current != config {
            debug!("熔断器配置已更新: {:?}", config);
            *current = config;
        }
    }

    pub async fn config(&self) -> CircuitBreakerConfig {
        self.config.read().await.clone()
    }

    /// Execute operation with circuit breaker protection
    pub async fn execute<F, Fut, T>(&self, operation: F) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let config = self.config().await;
        let admission = self.admit(&config).await?;

        let result = match tokio::time::timeout(config.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "存储调用超过 {:?}",
                config.call_timeout
            ))),
        };

        match &result {
            Err(e) if e.is_transient() => self.record_failure(&config, admission).await,
            _ => self.record_success(admission).await,
        }
        result
    }

    async fn admit(&self, config: &CircuitBreakerConfig) -> OrchestratorResult<Admission> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                Ok(Admission::Normal)
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(config.recovery_timeout);
                if elapsed >= config.recovery_timeout {
                    debug!("熔断器冷却结束，进入半开状态");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    inner.total_calls += 1;
                    Ok(Admission::Probe)
                } else {
                    inner.rejected_calls += 1;
                    Err(OrchestratorError::CircuitOpen {
                        retry_after: config.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => match inner.probe_started_at {
                // 已有探测在进行中
                Some(started) if now.duration_since(started) < config.call_timeout => {
                    inner.rejected_calls += 1;
                    Err(OrchestratorError::CircuitOpen {
                        retry_after: config.call_timeout - now.duration_since(started),
                    })
                }
                _ => {
                    inner.probe_started_at = Some(now);
                    inner.total_calls += 1;
                    Ok(Admission::Probe)
                }
            },
        }
    }

    async fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.write().await;
        if admission == Admission::Probe && inner.state == CircuitState::HalfOpen {
            debug!("探测调用成功，熔断器关闭");
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.opened_at = None;
            inner.probe_started_at = None;
        }
    }

    async fn record_failure(&self, config: &CircuitBreakerConfig, admission: Admission) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.failed_calls += 1;

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                warn!("探测调用失败，熔断器重新打开");
                inner.open(now);
            }
            (CircuitState::Closed, _) => {
                inner.prune(now, config.failure_window);
                inner.failures.push_back(now);
                if inner.failures.len() >= config.failure_threshold {
                    warn!(
                        "窗口内失败 {} 次，熔断器打开 {:?}",
                        inner.failures.len(),
                        config.recovery_timeout
                    );
                    inner.open(now);
                }
            }
            // 打开前已放行的调用，失败不再影响状态
            _ => {}
        }
    }

    /// Get current circuit state
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let config = self.config().await;
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.prune(now, config.failure_window);
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failures.len(),
            open_for_ms: inner
                .opened_at
                .map(|t| now.duration_since(t).as_millis() as u64),
            total_calls: inner.total_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
        }
    }

    /// Reset circuit breaker to closed state
    pub async fn reset(&self) {
        *self.inner.write().await = BreakerInner::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_millis(200),
        }
    }

    async fn fail(cb: &CircuitBreaker) -> OrchestratorResult<()> {
        cb.execute(|| async { Err::<(), _>(OrchestratorError::transient("connection reset")) })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = CircuitBreaker::with_config(fast_config());
        for _ in 0..5 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        let touched = Arc::new(AtomicUsize::new(0));
        let counter = touched.clone();
        let started = Instant::now();
        let result = cb
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(started.elapsed() < Duration::from_millis(5));
        assert!(matches!(result, Err(OrchestratorError::CircuitOpen { .. })));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let cb = CircuitBreaker::with_config(fast_config());
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let result = cb.execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.snapshot().await.failure_count, 0);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::with_config(fast_config());
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state().await, CircuitState::Open);

        let result = cb.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(OrchestratorError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_non_transient_errors_do_not_trip() {
        let cb = CircuitBreaker::with_config(fast_config());
        for _ in 0..10 {
            let _ = cb
                .execute(|| async { Err::<(), _>(OrchestratorError::conflict("duplicate id")) })
                .await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let mut config = fast_config();
        config.failure_window = Duration::from_millis(50);
        let cb = CircuitBreaker::with_config(config);
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.snapshot().await.failure_count, 1);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let mut config = fast_config();
        config.failure_threshold = 1;
        config.call_timeout = Duration::from_millis(20);
        let cb = CircuitBreaker::with_config(config);

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Timeout(_))));
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_update_config_applies_new_threshold() {
        let cb = CircuitBreaker::with_config(fast_config());
        let mut config = fast_config();
        config.failure_threshold = 2;
        cb.update_config(config).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
