use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 任务引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 请求未指定时的最大重试次数
    pub default_max_retries: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("默认重试次数不能为负数"));
        }
        Ok(())
    }
}

/// 事件总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// 每个主题待投递队列的容量
    pub queue_capacity: usize,
    /// 每个主题回放环形缓冲的容量
    pub replay_capacity: usize,
    /// 处理器失败后的重试次数
    pub max_handler_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// 在退避时间上叠加随机抖动
    pub retry_jitter: bool,
    pub dispatch_workers: usize,
    /// `publish` 在队列满时的默认阻塞时长
    pub publish_timeout_ms: u64,
    /// 把事件同步写入 events 表
    pub durable_log: bool,
    pub dead_letter_capacity: usize,
    /// events 表保留时长，0 表示不清理
    pub retention_seconds: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            replay_capacity: 100,
            max_handler_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            retry_jitter: true,
            dispatch_workers: 4,
            publish_timeout_ms: 1_000,
            durable_log: true,
            dead_letter_capacity: 10_000,
            retention_seconds: 7 * 24 * 3600,
        }
    }
}

impl EventBusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.retention_seconds > 0).then_some(Duration::from_secs(self.retention_seconds))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("主题队列容量必须大于0"));
        }
        if self.replay_capacity == 0 {
            return Err(anyhow::anyhow!("回放缓冲容量必须大于0"));
        }
        if self.dispatch_workers == 0 {
            return Err(anyhow::anyhow!("投递工作协程数必须大于0"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(anyhow::anyhow!("最大退避时间不能小于基础退避时间"));
        }
        Ok(())
    }
}

/// Worker注册中心配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Worker 预期的心跳间隔
    pub heartbeat_interval_seconds: u64,
    /// 存活窗口 = 心跳间隔 × 该倍数
    pub liveness_multiplier: u32,
    pub reap_interval_seconds: u64,
    /// 分配循环的轮询间隔
    pub assignment_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            liveness_multiplier: 3,
            reap_interval_seconds: 15,
            assignment_interval_ms: 500,
        }
    }
}

impl RegistryConfig {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds * u64::from(self.liveness_multiplier))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds)
    }

    pub fn assignment_interval(&self) -> Duration {
        Duration::from_millis(self.assignment_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.liveness_multiplier == 0 {
            return Err(anyhow::anyhow!("存活窗口倍数必须大于0"));
        }
        if self.reap_interval_seconds == 0 {
            return Err(anyhow::anyhow!("回收间隔必须大于0"));
        }
        if self.assignment_interval_ms == 0 {
            return Err(anyhow::anyhow!("分配间隔必须大于0"));
        }
        Ok(())
    }
}

/// 进程外 Worker 运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRuntimeConfig {
    pub worker_id: Option<String>,
    pub capabilities: Vec<String>,
    pub core_url: String,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_ms: u64,
    /// 执行期间检查取消标记的间隔
    pub cancel_check_interval_ms: u64,
    /// 最终状态回报在瞬时错误下持续重试的时限
    pub report_deadline_seconds: u64,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            capabilities: vec!["*".to_string()],
            core_url: "http://127.0.0.1:8080".to_string(),
            heartbeat_interval_seconds: 10,
            poll_interval_ms: 1_000,
            cancel_check_interval_ms: 1_000,
            report_deadline_seconds: 300,
        }
    }
}

impl WorkerRuntimeConfig {
    pub fn report_deadline(&self) -> Duration {
        Duration::from_secs(self.report_deadline_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Worker心跳间隔必须大于0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }
        if self.capabilities.is_empty() {
            return Err(anyhow::anyhow!("Worker至少需要一种能力"));
        }
        if self.report_deadline_seconds == 0 {
            return Err(anyhow::anyhow!("状态回报时限必须大于0"));
        }
        Ok(())
    }
}
