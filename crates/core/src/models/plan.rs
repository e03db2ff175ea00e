use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Task, TaskStatus};

/// 执行计划中的一个子任务
///
/// `id` 是调用方在本次请求内使用的本地键，`depends_on` 引用同一请求中的其他本地键。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTaskSpec {
    pub id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

impl PlanTaskSpec {
    pub fn new<I: Into<String>, T: Into<String>>(id: I, task_type: T) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload: serde_json::Value::Null,
            priority: 0,
            depends_on: Vec::new(),
            max_retries: None,
        }
    }

    pub fn depends_on<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 创建执行计划的请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanRequest {
    pub tasks: Vec<PlanTaskSpec>,
    /// 被本计划拆解的父任务
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// 为空时使用计划ID
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl PlanRequest {
    pub fn new(tasks: Vec<PlanTaskSpec>) -> Self {
        Self {
            tasks,
            ..Default::default()
        }
    }
}

/// 持久化的计划头信息，聚合状态不落库
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub parent_task_id: Option<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    /// 首次到达终态并发出通知的时间
    pub finished_at: Option<DateTime<Utc>>,
}

/// 计划创建结果：本地键到持久化任务ID的映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCreated {
    pub plan_id: String,
    pub correlation_id: String,
    pub task_ids: BTreeMap<String, String>,
}

/// 计划聚合状态，由子任务状态推导
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
    /// 全部终结、没有失败但存在被取消的子任务
    Cancelled,
}

impl PlanStatus {
    /// `failed` 状态本身已是不可恢复的（可重试的失败会回到 queued）
    pub fn derive(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        let mut any = false;
        let mut all_completed = true;
        let mut all_terminal = true;
        for status in statuses {
            any = true;
            if status == TaskStatus::Failed {
                return PlanStatus::Failed;
            }
            all_completed &= status == TaskStatus::Completed;
            all_terminal &= status.is_terminal();
        }
        match (any, all_completed, all_terminal) {
            (true, true, _) => PlanStatus::Completed,
            (true, false, true) => PlanStatus::Cancelled,
            _ => PlanStatus::Running,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, PlanStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计划及其子任务的视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub plan: ExecutionPlan,
    pub status: PlanStatus,
    pub tasks: Vec<Task>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn test_derive_plan_status() {
        assert_eq!(PlanStatus::derive([Completed, Completed]), PlanStatus::Completed);
        assert_eq!(PlanStatus::derive([Completed, Running]), PlanStatus::Running);
        assert_eq!(PlanStatus::derive([Queued, Failed]), PlanStatus::Failed);
        assert_eq!(PlanStatus::derive([Completed, Cancelled]), PlanStatus::Cancelled);
        assert_eq!(PlanStatus::derive([Cancelled, Queued]), PlanStatus::Running);
        assert_eq!(PlanStatus::derive(Vec::new()), PlanStatus::Running);
    }
}
