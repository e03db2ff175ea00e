//! 任务与执行计划引擎
//!
//! 负责任务生命周期：创建、认领、状态转换、取消、回收，以及计划内的依赖重新评估。
//! 所有状态变更都委托给仓储层的条件更新，引擎自身不持有锁；每次成功的转换都会广播到事件总线。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use orchestrator_core::{
    topics, CancelOutcome, ConfigHandle, EventDraft, EventPriority, EventPublisher,
    ExecutionPlan, NewTask, OrchestratorError, OrchestratorResult, PlanCreated, PlanRequest,
    PlanStatus, PlanView, Task, TaskRepository, TaskStatus, TaskStatusCounts, TransitionOutcome,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::plan_validator::validate_plan;

/// 一次状态更新的结果
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub applied: bool,
    pub task: Task,
    /// 转换前持有任务的 Worker
    pub previous_assignee: Option<String>,
}

pub struct TaskEngine {
    repo: Arc<dyn TaskRepository>,
    events: Arc<dyn EventPublisher>,
    config: ConfigHandle,
}

impl TaskEngine {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        events: Arc<dyn EventPublisher>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            repo,
            events,
            config,
        }
    }

    fn default_max_retries(&self) -> i32 {
        self.config.current().engine.default_max_retries
    }

    fn build_task(
        &self,
        id: String,
        task_type: String,
        payload: Value,
        priority: i64,
        max_retries: Option<i32>,
        parent_plan_id: Option<String>,
    ) -> OrchestratorResult<Task> {
        if task_type.trim().is_empty() {
            return Err(OrchestratorError::validation("任务类型不能为空"));
        }
        let max_retries = max_retries.unwrap_or_else(|| self.default_max_retries());
        if max_retries < 0 {
            return Err(OrchestratorError::validation("重试次数不能为负数"));
        }
        let now = Utc::now();
        Ok(Task {
            id,
            task_type,
            payload,
            priority,
            status: TaskStatus::Queued,
            assignee: None,
            parent_plan_id,
            depends_on: Vec::new(),
            retry_count: 0,
            max_retries,
            cancel_requested: false,
            result: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn emit(
        &self,
        topic: &str,
        payload: Value,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) -> OrchestratorResult<()> {
        let draft = EventDraft::new(topic, payload)
            .with_priority(priority)
            .with_correlation_id(correlation_id);
        self.events.publish(draft).await?;
        Ok(())
    }

    /// 计划子任务使用计划的 correlation id，独立任务使用自身ID
    async fn correlation_for(&self, task: &Task) -> OrchestratorResult<String> {
        match &task.parent_plan_id {
            Some(plan_id) => Ok(self
                .repo
                .get_plan(plan_id)
                .await?
                .map(|plan| plan.correlation_id)
                .unwrap_or_else(|| plan_id.clone())),
            None => Ok(task.id.clone()),
        }
    }

    #[instrument(skip(self, request), fields(task_type = %request.task_type))]
    pub async fn create_task(&self, request: NewTask) -> OrchestratorResult<String> {
        let mut ids = self.batch_create(vec![request]).await?;
        ids.pop()
            .ok_or_else(|| OrchestratorError::internal("创建任务未返回ID"))
    }

    /// 批量创建独立任务，全部成功或全部失败
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn batch_create(&self, requests: Vec<NewTask>) -> OrchestratorResult<Vec<String>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let tasks = requests
            .into_iter()
            .map(|r| {
                self.build_task(
                    Uuid::new_v4().to_string(),
                    r.task_type,
                    r.payload,
                    r.priority,
                    r.max_retries,
                    None,
                )
            })
            .collect::<OrchestratorResult<Vec<_>>>()?;

        self.repo.insert_tasks(&tasks).await?;
        metrics::counter!("orchestrator_tasks_created_total").increment(tasks.len() as u64);

        for task in &tasks {
            self.emit(
                topics::TASK_CREATED,
                json!({
                    "task_id": task.id,
                    "task_type": task.task_type,
                    "priority": task.priority,
                }),
                EventPriority::Default,
                Some(task.id.clone()),
            )
            .await?;
        }
        debug!("创建任务 {} 个", tasks.len());
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// 校验依赖图后在一个事务内写入计划、子任务与依赖边
    #[instrument(skip(self, request), fields(tasks = request.tasks.len()))]
    pub async fn create_plan(&self, request: PlanRequest) -> OrchestratorResult<PlanCreated> {
        let graph = validate_plan(&request.tasks)?;

        let plan_id = Uuid::new_v4().to_string();
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| plan_id.clone());
        let persisted_ids: Vec<String> = request
            .tasks
            .iter()
            .map(|spec| format!("{plan_id}:{}", spec.id))
            .collect();

        let mut tasks = Vec::with_capacity(request.tasks.len());
        for &idx in &graph.order {
            let spec = &request.tasks[idx];
            tasks.push(self.build_task(
                persisted_ids[idx].clone(),
                spec.task_type.clone(),
                spec.payload.clone(),
                spec.priority,
                spec.max_retries,
                Some(plan_id.clone()),
            )?);
        }
        let edges: Vec<(String, String)> = graph
            .edges
            .iter()
            .map(|&(task, dep)| (persisted_ids[task].clone(), persisted_ids[dep].clone()))
            .collect();

        let plan = ExecutionPlan {
            id: plan_id.clone(),
            parent_task_id: request.parent_task_id.clone(),
            correlation_id: correlation_id.clone(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.repo.insert_plan(&plan, &tasks, &edges).await?;
        metrics::counter!("orchestrator_tasks_created_total").increment(tasks.len() as u64);

        let task_ids: BTreeMap<String, String> = request
            .tasks
            .iter()
            .zip(persisted_ids)
            .map(|(spec, id)| (spec.id.clone(), id))
            .collect();

        self.emit(
            topics::PLAN_CREATED,
            json!({
                "plan_id": plan_id,
                "parent_task_id": plan.parent_task_id,
                "task_ids": task_ids,
            }),
            EventPriority::Default,
            Some(correlation_id.clone()),
        )
        .await?;
        for task in &tasks {
            self.emit(
                topics::TASK_CREATED,
                json!({
                    "task_id": task.id,
                    "task_type": task.task_type,
                    "priority": task.priority,
                    "plan_id": plan_id,
                }),
                EventPriority::Default,
                Some(correlation_id.clone()),
            )
            .await?;
        }

        info!(
            "执行计划已创建: {}，{} 个子任务，{} 条依赖",
            plan_id,
            tasks.len(),
            edges.len()
        );
        Ok(PlanCreated {
            plan_id,
            correlation_id,
            task_ids,
        })
    }

    /// 认领下一个可执行任务，没有时返回 `None`
    #[instrument(skip(self, capabilities))]
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>> {
        let Some(task) = self.repo.claim_next(worker_id, capabilities).await? else {
            return Ok(None);
        };
        metrics::counter!("orchestrator_tasks_claimed_total").increment(1);

        // 认领已提交：通知失败时任务必须交还队列，否则交给调用方，不能悬空
        if let Err(e) = self.announce_assignment(&task, worker_id).await {
            return match self.repo.release(&task.id, worker_id).await {
                Ok(_) => {
                    warn!("任务 {} 的分配通知失败，已交还队列: {}", task.id, e);
                    Err(e)
                }
                Err(release_err) => {
                    error!(
                        "任务 {} 的分配通知失败且无法交还队列，仍交给 {}: {} / {}",
                        task.id, worker_id, e, release_err
                    );
                    Ok(Some(task))
                }
            };
        }
        debug!("任务 {} 已分配给 {}", task.id, worker_id);
        Ok(Some(task))
    }

    async fn announce_assignment(&self, task: &Task, worker_id: &str) -> OrchestratorResult<()> {
        let correlation_id = self.correlation_for(task).await?;
        self.emit(
            topics::TASK_ASSIGNED,
            json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "worker_id": worker_id,
            }),
            EventPriority::Default,
            Some(correlation_id),
        )
        .await
    }

    /// 更新任务状态；已处于目标状态时返回 `false`
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<bool> {
        Ok(self.transition(task_id, status, result).await?.applied)
    }

    #[instrument(skip(self, result))]
    pub async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<StatusChange> {
        if status == TaskStatus::Assigned {
            return Err(OrchestratorError::validation(
                "任务只能通过认领进入 assigned 状态",
            ));
        }
        let previous_assignee = self
            .repo
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?
            .assignee;

        let outcome = self.repo.transition(task_id, status, result).await?;
        let applied = outcome.is_applied();
        let task = outcome.into_task();
        if applied {
            self.after_transition(&task, status, previous_assignee.as_deref())
                .await?;
        }
        Ok(StatusChange {
            applied,
            task,
            previous_assignee,
        })
    }

    /// 批量状态更新，全部成功或全部回滚；返回每个任务是否发生了变化
    #[instrument(skip(self, task_ids), fields(count = task_ids.len()))]
    pub async fn batch_update_status(
        &self,
        task_ids: &[String],
        status: TaskStatus,
    ) -> OrchestratorResult<Vec<bool>> {
        if status == TaskStatus::Assigned {
            return Err(OrchestratorError::validation(
                "任务只能通过认领进入 assigned 状态",
            ));
        }
        let outcomes = self.repo.transition_batch(task_ids, status).await?;
        let mut applied = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            applied.push(outcome.is_applied());
            if let TransitionOutcome::Applied(task) = outcome {
                self.after_transition(&task, status, None).await?;
            }
        }
        Ok(applied)
    }

    /// 转换成功后的事件广播、依赖重新评估与计划终结检查
    async fn after_transition(
        &self,
        task: &Task,
        requested: TaskStatus,
        worker_id: Option<&str>,
    ) -> OrchestratorResult<()> {
        metrics::counter!(
            "orchestrator_task_transitions_total",
            "status" => task.status.as_str()
        )
        .increment(1);
        let correlation_id = self.correlation_for(task).await?;
        let base = json!({
            "task_id": task.id,
            "task_type": task.task_type,
            "worker_id": worker_id,
            "plan_id": task.parent_plan_id,
        });
        let with = |extra: Value| {
            let mut payload = base.clone();
            if let (Some(target), Value::Object(fields)) = (payload.as_object_mut(), extra) {
                target.extend(fields);
            }
            payload
        };

        match (requested, task.status) {
            (TaskStatus::Running, _) => {
                self.emit(
                    topics::TASK_STARTED,
                    base.clone(),
                    EventPriority::Default,
                    Some(correlation_id),
                )
                .await?;
            }
            (TaskStatus::Completed, _) => {
                self.emit(
                    topics::TASK_COMPLETED,
                    with(json!({ "result": task.result })),
                    EventPriority::Default,
                    Some(correlation_id.clone()),
                )
                .await?;
                self.release_dependents(task, &correlation_id).await?;
                self.check_plan_finished(task).await?;
            }
            (TaskStatus::Failed, TaskStatus::Queued) => {
                self.emit(
                    topics::TASK_FAILED,
                    with(json!({
                        "will_retry": true,
                        "retry_count": task.retry_count,
                        "max_retries": task.max_retries,
                        "result": task.result,
                    })),
                    EventPriority::High,
                    Some(correlation_id.clone()),
                )
                .await?;
                self.emit(
                    topics::TASK_QUEUED,
                    with(json!({ "reason": "retry", "retry_count": task.retry_count })),
                    EventPriority::Default,
                    Some(correlation_id),
                )
                .await?;
            }
            (TaskStatus::Failed, _) => {
                warn!("任务 {} 失败且不再重试", task.id);
                self.emit(
                    topics::TASK_FAILED,
                    with(json!({
                        "will_retry": false,
                        "retry_count": task.retry_count,
                        "max_retries": task.max_retries,
                        "result": task.result,
                    })),
                    EventPriority::High,
                    Some(correlation_id),
                )
                .await?;
                self.check_plan_finished(task).await?;
            }
            (TaskStatus::Cancelled, _) => {
                self.emit(
                    topics::TASK_CANCELLED,
                    base.clone(),
                    EventPriority::Default,
                    Some(correlation_id),
                )
                .await?;
                self.check_plan_finished(task).await?;
            }
            (TaskStatus::Queued, _) => {
                self.emit(
                    topics::TASK_QUEUED,
                    with(json!({ "reason": "requeued" })),
                    EventPriority::Default,
                    Some(correlation_id),
                )
                .await?;
            }
            (TaskStatus::Assigned, _) => {}
        }
        Ok(())
    }

    /// 依赖刚完成的任务且前置全部完成的子任务现在可以被认领
    async fn release_dependents(&self, task: &Task, correlation_id: &str) -> OrchestratorResult<()> {
        if task.parent_plan_id.is_none() {
            return Ok(());
        }
        for ready in self.repo.ready_dependents(&task.id).await? {
            debug!("子任务 {} 的依赖已全部完成", ready.id);
            self.emit(
                topics::TASK_READY,
                json!({
                    "task_id": ready.id,
                    "task_type": ready.task_type,
                    "plan_id": ready.parent_plan_id,
                    "unblocked_by": task.id,
                }),
                EventPriority::Default,
                Some(correlation_id.to_string()),
            )
            .await?;
        }
        Ok(())
    }

    async fn check_plan_finished(&self, task: &Task) -> OrchestratorResult<()> {
        let Some(plan_id) = task.parent_plan_id.as_deref() else {
            return Ok(());
        };
        let tasks = self.repo.plan_tasks(plan_id).await?;
        let status = PlanStatus::derive(tasks.iter().map(|t| t.status));
        if !status.is_finished() || !self.repo.mark_plan_finished(plan_id).await? {
            return Ok(());
        }

        let (topic, priority) = match status {
            PlanStatus::Completed => (topics::PLAN_COMPLETED, EventPriority::Default),
            PlanStatus::Failed => (topics::PLAN_FAILED, EventPriority::High),
            _ => (topics::PLAN_CANCELLED, EventPriority::Default),
        };
        let correlation_id = self.correlation_for(task).await?;
        info!("执行计划 {} 已结束: {}", plan_id, status);
        self.emit(
            topic,
            json!({
                "plan_id": plan_id,
                "status": status,
                "tasks": tasks.len(),
            }),
            priority,
            Some(correlation_id),
        )
        .await
    }

    /// 请求取消：未运行的任务立即取消，运行中的任务打上标记等待 Worker 确认
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: &str) -> OrchestratorResult<CancelOutcome> {
        let outcome = self.repo.request_cancel(task_id).await?;
        match &outcome {
            CancelOutcome::Cancelled(task) => {
                self.after_transition(task, TaskStatus::Cancelled, None)
                    .await?;
            }
            CancelOutcome::Flagged(task) => {
                let correlation_id = self.correlation_for(task).await?;
                self.emit(
                    topics::TASK_CANCEL_REQUESTED,
                    json!({
                        "task_id": task.id,
                        "worker_id": task.assignee,
                    }),
                    EventPriority::High,
                    Some(correlation_id),
                )
                .await?;
            }
            CancelOutcome::AlreadyFinished(task) => {
                debug!("任务 {} 已处于终态 {}，忽略取消", task.id, task.status);
            }
        }
        Ok(outcome)
    }

    pub async fn is_cancel_requested(&self, task_id: &str) -> OrchestratorResult<bool> {
        Ok(self.get_task(task_id).await?.cancel_requested)
    }

    /// 回收失联 Worker 持有的任务，返回被回收的任务ID
    #[instrument(skip(self))]
    pub async fn reclaim_worker_tasks(&self, worker_id: &str) -> OrchestratorResult<Vec<String>> {
        let tasks = self.repo.reclaim_worker_tasks(worker_id).await?;
        for task in &tasks {
            if task.status == TaskStatus::Cancelled {
                self.after_transition(task, TaskStatus::Cancelled, Some(worker_id))
                    .await?;
                continue;
            }
            let correlation_id = self.correlation_for(task).await?;
            self.emit(
                topics::TASK_QUEUED,
                json!({
                    "task_id": task.id,
                    "task_type": task.task_type,
                    "worker_id": worker_id,
                    "reason": "worker_lost",
                }),
                EventPriority::Default,
                Some(correlation_id),
            )
            .await?;
        }
        if !tasks.is_empty() {
            warn!("已回收 Worker {} 的 {} 个任务", worker_id, tasks.len());
            metrics::counter!("orchestrator_tasks_reclaimed_total").increment(tasks.len() as u64);
        }
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// 把未能交付给 Worker 的 assigned 任务交还队列
    #[instrument(skip(self))]
    pub async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<bool> {
        let Some(task) = self.repo.release(task_id, worker_id).await? else {
            return Ok(false);
        };
        let correlation_id = self.correlation_for(&task).await?;
        self.emit(
            topics::TASK_QUEUED,
            json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "worker_id": worker_id,
                "reason": "released",
            }),
            EventPriority::Default,
            Some(correlation_id),
        )
        .await?;
        Ok(true)
    }

    pub async fn get_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.repo
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))
    }

    pub async fn plan_tasks(&self, plan_id: &str) -> OrchestratorResult<Vec<Task>> {
        Ok(self.plan_status(plan_id).await?.tasks)
    }

    pub async fn plan_status(&self, plan_id: &str) -> OrchestratorResult<PlanView> {
        let plan = self
            .repo
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| OrchestratorError::PlanNotFound {
                id: plan_id.to_string(),
            })?;
        let tasks = self.repo.plan_tasks(plan_id).await?;
        let status = PlanStatus::derive(tasks.iter().map(|t| t.status));
        Ok(PlanView {
            plan,
            status,
            tasks,
        })
    }

    pub async fn status_counts(&self) -> OrchestratorResult<TaskStatusCounts> {
        self.repo.status_counts().await
    }
}
