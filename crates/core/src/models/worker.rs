use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 能力通配符：可处理任意任务类型
pub const ANY_CAPABILITY: &str = "*";

/// Worker节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    /// 可服务的任务类型集合
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// 仅供分配参考，任务归属以任务表为准
    pub current_task_id: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new<S: Into<String>>(id: S, capabilities: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capabilities,
            status: WorkerStatus::Idle,
            last_heartbeat: now,
            current_task_id: None,
            registered_at: now,
        }
    }

    /// 检查Worker是否能处理该类型的任务
    pub fn serves(&self, task_type: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == ANY_CAPABILITY || c == task_type)
    }

    pub fn is_online(&self) -> bool {
        self.status != WorkerStatus::Offline
    }

    /// 检查心跳是否超过存活窗口
    pub fn is_heartbeat_expired(&self, liveness_window: std::time::Duration, now: DateTime<Utc>) -> bool {
        let window = Duration::from_std(liveness_window).unwrap_or(Duration::MAX);
        now - self.last_heartbeat > window
    }
}

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// 正在执行任务
    Active,
    /// 在线且空闲
    Idle,
    /// 心跳超时
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "idle" => Ok(WorkerStatus::Idle),
            "offline" => Ok(WorkerStatus::Offline),
            other => Err(format!("未知的Worker状态: {other}")),
        }
    }
}

sqlite_text_enum!(WorkerStatus, "worker status");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_capability() {
        let worker = WorkerInfo::new("w1", vec![ANY_CAPABILITY.to_string()]);
        assert!(worker.serves("deploy"));
        assert!(worker.serves("review"));

        let worker = WorkerInfo::new("w2", vec!["review".to_string()]);
        assert!(worker.serves("review"));
        assert!(!worker.serves("deploy"));
    }

    #[test]
    fn test_heartbeat_expiry() {
        let mut worker = WorkerInfo::new("w1", vec![]);
        let now = Utc::now();
        worker.last_heartbeat = now - Duration::seconds(100);
        assert!(worker.is_heartbeat_expired(std::time::Duration::from_secs(90), now));
        assert!(!worker.is_heartbeat_expired(std::time::Duration::from_secs(120), now));
    }
}
