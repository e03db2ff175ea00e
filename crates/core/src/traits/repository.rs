//! 数据仓储层接口定义
//!
//! - `TaskRepository`：任务与执行计划，所有状态变更都是单条条件更新或单个事务
//! - `WorkerRepository`：Worker 注册与存活信息
//!
//! 并发正确性由实现中的条件更新保证，调用方不需要额外加锁。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{
    CancelOutcome, ExecutionPlan, Task, TaskStatus, TaskStatusCounts, TransitionOutcome,
    WorkerInfo, WorkerStatus,
};
use crate::OrchestratorResult;

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 批量插入独立任务，全部成功或全部回滚
    async fn insert_tasks(&self, tasks: &[Task]) -> OrchestratorResult<()>;

    /// 在一个事务内写入计划头、子任务和依赖边
    async fn insert_plan(
        &self,
        plan: &ExecutionPlan,
        tasks: &[Task],
        edges: &[(String, String)],
    ) -> OrchestratorResult<()>;

    async fn get(&self, task_id: &str) -> OrchestratorResult<Option<Task>>;

    async fn get_plan(&self, plan_id: &str) -> OrchestratorResult<Option<ExecutionPlan>>;

    async fn plan_tasks(&self, plan_id: &str) -> OrchestratorResult<Vec<Task>>;

    /// 原子认领下一个可执行任务，没有时返回 `None`
    async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>>;

    /// 条件状态更新；失败且有剩余重试次数时回到 queued
    async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<TransitionOutcome>;

    /// 批量状态更新，任一任务不满足转换条件则整体回滚
    async fn transition_batch(
        &self,
        task_ids: &[String],
        target: TaskStatus,
    ) -> OrchestratorResult<Vec<TransitionOutcome>>;

    async fn request_cancel(&self, task_id: &str) -> OrchestratorResult<CancelOutcome>;

    /// 把 worker 持有的 assigned 任务交还队列
    async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<Option<Task>>;

    /// 回收 worker 持有的 assigned / running 任务
    async fn reclaim_worker_tasks(&self, worker_id: &str) -> OrchestratorResult<Vec<Task>>;

    /// 依赖 `task_id` 且前置已全部完成的 queued 子任务
    async fn ready_dependents(&self, task_id: &str) -> OrchestratorResult<Vec<Task>>;

    /// 标记计划已终结，只有第一次调用返回 true
    async fn mark_plan_finished(&self, plan_id: &str) -> OrchestratorResult<bool>;

    async fn status_counts(&self) -> OrchestratorResult<TaskStatusCounts>;
}

/// Worker仓储接口
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 注册或重新注册，重新注册会复活 offline 的 Worker
    async fn upsert(&self, worker_id: &str, capabilities: &[String])
        -> OrchestratorResult<WorkerInfo>;

    async fn heartbeat(&self, worker_id: &str, status: WorkerStatus)
        -> OrchestratorResult<WorkerInfo>;

    async fn get(&self, worker_id: &str) -> OrchestratorResult<Option<WorkerInfo>>;

    /// 最近一次心跳晚于 `live_since` 的在线 Worker
    async fn list_active(
        &self,
        capability: Option<&str>,
        live_since: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<WorkerInfo>>;

    /// 把心跳早于 `cutoff` 的在线 Worker 标记为 offline 并返回它们
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>)
        -> OrchestratorResult<Vec<WorkerInfo>>;

    /// 已是 offline 但名下仍有 assigned / running 任务的 Worker ID
    async fn offline_task_holders(&self) -> OrchestratorResult<Vec<String>>;

    async fn set_current_task(
        &self,
        worker_id: &str,
        task_id: Option<&str>,
    ) -> OrchestratorResult<()>;

    async fn count_by_status(&self) -> OrchestratorResult<Vec<(WorkerStatus, u64)>>;
}
