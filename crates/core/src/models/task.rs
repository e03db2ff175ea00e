use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务：可被认领的最小工作单元
///
/// `assignee` 当且仅当状态为 `assigned` 或 `running` 时非空。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// 数值越大越紧急
    pub priority: i64,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub parent_plan_id: Option<String>,
    /// 同一计划内的前置任务ID
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// 运行中任务的协作式取消标记
    pub cancel_requested: bool,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 失败后是否还能重新排队
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 任务状态
///
/// ```text
/// queued → assigned → running → completed
///    ↑        │          ├────→ failed (有剩余重试次数时回到 queued)
///    └────────┴──────────┘ 回收 / 释放
/// 任意非终态 → cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 持有者（assignee）只在这两个状态下存在
    pub fn is_held(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    /// 能转换到 `target` 的源状态集合
    ///
    /// `assigned` 只能通过认领到达，这里仍列出 `queued` 供认领语句使用。
    pub fn allowed_sources(target: TaskStatus) -> &'static [TaskStatus] {
        match target {
            TaskStatus::Queued => &[TaskStatus::Assigned, TaskStatus::Running],
            TaskStatus::Assigned => &[TaskStatus::Queued],
            TaskStatus::Running => &[TaskStatus::Assigned],
            TaskStatus::Completed => &[TaskStatus::Running],
            TaskStatus::Failed => &[TaskStatus::Running],
            TaskStatus::Cancelled => &[
                TaskStatus::Queued,
                TaskStatus::Assigned,
                TaskStatus::Running,
            ],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        Self::allowed_sources(target).contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("未知的任务状态: {other}")),
        }
    }
}

sqlite_text_enum!(TaskStatus, "task status");

/// 创建独立任务的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    /// 为空时使用配置中的默认值
    #[serde(default)]
    pub max_retries: Option<i32>,
}

impl NewTask {
    pub fn new<S: Into<String>>(task_type: S, payload: serde_json::Value, priority: i64) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// 状态更新的结果
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// 已应用；失败且有剩余重试次数时，任务的新状态是 queued
    Applied(Task),
    /// 任务已处于目标状态，幂等地忽略
    Unchanged(Task),
}

impl TransitionOutcome {
    pub fn task(&self) -> &Task {
        match self {
            TransitionOutcome::Applied(task) | TransitionOutcome::Unchanged(task) => task,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            TransitionOutcome::Applied(task) | TransitionOutcome::Unchanged(task) => task,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// 取消请求的结果
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// queued / assigned 任务被立即取消
    Cancelled(Task),
    /// running 任务只被打上取消标记，等待 Worker 确认
    Flagged(Task),
    /// 已处于终态
    AlreadyFinished(Task),
}

/// 各状态的任务数量
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatusCounts {
    pub queued: u64,
    pub assigned: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskStatusCounts {
    pub fn set(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Queued => self.queued = count,
            TaskStatus::Assigned => self.assigned = count,
            TaskStatus::Running => self.running = count,
            TaskStatus::Completed => self.completed = count,
            TaskStatus::Failed => self.failed = count,
            TaskStatus::Cancelled => self.cancelled = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.assigned + self.running + self.completed + self.failed + self.cancelled
    }
}
