use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use orchestrator_core::{
    CancelOutcome, ExecutionPlan, OrchestratorError, OrchestratorResult, Task, TaskRepository,
    TaskStatus, TaskStatusCounts, TransitionOutcome,
};
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, SqliteExecutor};
use tracing::{debug, instrument};

use crate::database::mapping::{row_to_plan, row_to_task, to_millis};
use crate::database::statements::*;
use crate::database::DatabaseManager;

/// 基于 SQLite 的任务仓储
///
/// 状态变更都是带源状态条件的单条 `UPDATE ... RETURNING`，
/// 返回零行时再读取当前行判断原因。
pub struct SqliteTaskRepository {
    db: Arc<DatabaseManager>,
}

impl SqliteTaskRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }
}

fn sources_json(target: TaskStatus) -> String {
    let sources: Vec<&str> = TaskStatus::allowed_sources(target)
        .iter()
        .map(TaskStatus::as_str)
        .collect();
    Value::from(sources).to_string()
}

async fn fetch_task<'e, E>(executor: E, task_id: &str) -> OrchestratorResult<Option<Task>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(SELECT_TASK)
        .bind(task_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

/// 为任务补齐 `depends_on`
async fn attach_dependencies<'e, E>(executor: E, tasks: &mut [Task]) -> OrchestratorResult<()>
where
    E: SqliteExecutor<'e>,
{
    if tasks.is_empty() {
        return Ok(());
    }
    let ids = Value::from(tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>());
    let rows = sqlx::query(SELECT_DEPENDENCIES)
        .bind(ids.to_string())
        .fetch_all(executor)
        .await?;

    let mut deps: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        deps.entry(row.try_get("task_id")?)
            .or_default()
            .push(row.try_get("depends_on_id")?);
    }
    for task in tasks.iter_mut() {
        task.depends_on = deps.remove(&task.id).unwrap_or_default();
    }
    Ok(())
}

/// 条件更新没有命中时判断原因
fn diagnose_transition(
    task_id: &str,
    current: Option<Task>,
    target: TaskStatus,
) -> OrchestratorResult<TransitionOutcome> {
    match current {
        None => Err(OrchestratorError::task_not_found(task_id)),
        Some(task) if task.status == target => Ok(TransitionOutcome::Unchanged(task)),
        Some(task) => Err(OrchestratorError::InvalidTransition {
            task_id: task_id.to_string(),
            from: task.status.to_string(),
            to: target.to_string(),
        }),
    }
}

async fn transition_on(
    conn: &mut SqliteConnection,
    task_id: &str,
    target: TaskStatus,
    result: Option<&Value>,
) -> OrchestratorResult<TransitionOutcome> {
    let row = sqlx::query(UPDATE_TASK_STATUS)
        .bind(task_id)
        .bind(target.as_str())
        .bind(result.map(Value::to_string))
        .bind(to_millis(Utc::now()))
        .bind(sources_json(target))
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => Ok(TransitionOutcome::Applied(row_to_task(&row)?)),
        None => {
            let current = fetch_task(&mut *conn, task_id).await?;
            diagnose_transition(task_id, current, target)
        }
    }
}

async fn insert_task_row(conn: &mut SqliteConnection, task: &Task) -> OrchestratorResult<()> {
    sqlx::query(INSERT_TASK)
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(task.payload.to_string())
        .bind(task.priority)
        .bind(task.parent_plan_id.as_deref())
        .bind(task.max_retries)
        .bind(to_millis(task.created_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn insert_tasks(&self, tasks: &[Task]) -> OrchestratorResult<()> {
        let tasks = tasks.to_vec();
        self.db
            .transaction(move |conn| {
                Box::pin(async move {
                    for task in &tasks {
                        insert_task_row(conn, task).await?;
                    }
                    debug!("批量写入任务成功: {} 个", tasks.len());
                    Ok::<_, OrchestratorError>(())
                })
            })
            .await
    }

    #[instrument(skip(self, plan, tasks, edges), fields(plan_id = %plan.id, tasks = tasks.len()))]
    async fn insert_plan(
        &self,
        plan: &ExecutionPlan,
        tasks: &[Task],
        edges: &[(String, String)],
    ) -> OrchestratorResult<()> {
        let plan = plan.clone();
        let tasks = tasks.to_vec();
        let edges = edges.to_vec();
        self.db
            .transaction(move |conn| {
                Box::pin(async move {
                    sqlx::query(INSERT_PLAN)
                        .bind(&plan.id)
                        .bind(plan.parent_task_id.as_deref())
                        .bind(&plan.correlation_id)
                        .bind(to_millis(plan.created_at))
                        .execute(&mut *conn)
                        .await?;
                    for task in &tasks {
                        insert_task_row(conn, task).await?;
                    }
                    for (task_id, depends_on_id) in &edges {
                        sqlx::query(INSERT_DEPENDENCY)
                            .bind(task_id)
                            .bind(depends_on_id)
                            .execute(&mut *conn)
                            .await?;
                    }
                    debug!(
                        "写入执行计划成功: {}，{} 个任务，{} 条依赖",
                        plan.id,
                        tasks.len(),
                        edges.len()
                    );
                    Ok::<_, OrchestratorError>(())
                })
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get(&self, task_id: &str) -> OrchestratorResult<Option<Task>> {
        self.db
            .run(|pool| async move {
                let Some(task) = fetch_task(&pool, task_id).await? else {
                    return Ok(None);
                };
                let mut tasks = [task];
                attach_dependencies(&pool, &mut tasks).await?;
                let [task] = tasks;
                Ok(Some(task))
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: &str) -> OrchestratorResult<Option<ExecutionPlan>> {
        self.db
            .run(|pool| async move {
                let row = sqlx::query(SELECT_PLAN)
                    .bind(plan_id)
                    .fetch_optional(&pool)
                    .await?;
                row.as_ref().map(row_to_plan).transpose()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn plan_tasks(&self, plan_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(SELECT_PLAN_TASKS)
                    .bind(plan_id)
                    .fetch_all(&pool)
                    .await?;
                let mut tasks = rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?;
                attach_dependencies(&pool, &mut tasks).await?;
                Ok(tasks)
            })
            .await
    }

    #[instrument(skip(self, capabilities))]
    async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>> {
        if capabilities.is_empty() {
            return Ok(None);
        }
        let caps = serde_json::to_string(capabilities)?;
        self.db
            .run(|pool| async move {
                let row = sqlx::query(CLAIM_NEXT_TASK)
                    .bind(worker_id)
                    .bind(caps)
                    .bind(to_millis(Utc::now()))
                    .fetch_optional(&pool)
                    .await?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let mut tasks = [row_to_task(&row)?];
                attach_dependencies(&pool, &mut tasks).await?;
                let [task] = tasks;
                debug!("Worker {} 认领任务: {}", worker_id, task.id);
                Ok(Some(task))
            })
            .await
    }

    #[instrument(skip(self, result))]
    async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<TransitionOutcome> {
        self.db
            .run(|pool| async move {
                let mut conn = pool.acquire().await?;
                transition_on(&mut *conn, task_id, target, result.as_ref()).await
            })
            .await
    }

    #[instrument(skip(self, task_ids), fields(count = task_ids.len()))]
    async fn transition_batch(
        &self,
        task_ids: &[String],
        target: TaskStatus,
    ) -> OrchestratorResult<Vec<TransitionOutcome>> {
        let task_ids = task_ids.to_vec();
        self.db
            .transaction(move |conn| {
                Box::pin(async move {
                    let mut outcomes = Vec::with_capacity(task_ids.len());
                    for task_id in &task_ids {
                        outcomes.push(transition_on(conn, task_id, target, None).await?);
                    }
                    Ok::<_, OrchestratorError>(outcomes)
                })
            })
            .await
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, task_id: &str) -> OrchestratorResult<CancelOutcome> {
        self.db
            .run(|pool| async move {
                let row = sqlx::query(REQUEST_CANCEL)
                    .bind(task_id)
                    .bind(to_millis(Utc::now()))
                    .fetch_optional(&pool)
                    .await?;
                match row {
                    Some(row) => {
                        let task = row_to_task(&row)?;
                        if task.status == TaskStatus::Cancelled {
                            Ok(CancelOutcome::Cancelled(task))
                        } else {
                            Ok(CancelOutcome::Flagged(task))
                        }
                    }
                    None => match fetch_task(&pool, task_id).await? {
                        Some(task) => Ok(CancelOutcome::AlreadyFinished(task)),
                        None => Err(OrchestratorError::task_not_found(task_id)),
                    },
                }
            })
            .await
    }

    #[instrument(skip(self))]
    async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<Option<Task>> {
        self.db
            .run(|pool| async move {
                let row = sqlx::query(RELEASE_TASK)
                    .bind(task_id)
                    .bind(worker_id)
                    .bind(to_millis(Utc::now()))
                    .fetch_optional(&pool)
                    .await?;
                row.as_ref().map(row_to_task).transpose()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn reclaim_worker_tasks(&self, worker_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(RECLAIM_WORKER_TASKS)
                    .bind(worker_id)
                    .bind(to_millis(Utc::now()))
                    .fetch_all(&pool)
                    .await?;
                let tasks = rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?;
                if !tasks.is_empty() {
                    debug!("回收 Worker {} 的 {} 个任务", worker_id, tasks.len());
                }
                Ok(tasks)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn ready_dependents(&self, task_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(SELECT_READY_DEPENDENTS)
                    .bind(task_id)
                    .fetch_all(&pool)
                    .await?;
                let mut tasks = rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?;
                attach_dependencies(&pool, &mut tasks).await?;
                Ok(tasks)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn mark_plan_finished(&self, plan_id: &str) -> OrchestratorResult<bool> {
        self.db
            .run(|pool| async move {
                let result = sqlx::query(MARK_PLAN_FINISHED)
                    .bind(plan_id)
                    .bind(to_millis(Utc::now()))
                    .execute(&pool)
                    .await?;
                Ok(result.rows_affected() == 1)
            })
            .await
    }

    async fn status_counts(&self) -> OrchestratorResult<TaskStatusCounts> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(COUNT_TASKS_BY_STATUS)
                    .fetch_all(&pool)
                    .await?;
                let mut counts = TaskStatusCounts::default();
                for row in rows {
                    let status: TaskStatus = row.try_get("status")?;
                    let n: i64 = row.try_get("n")?;
                    counts.set(status, n.max(0) as u64);
                }
                Ok(counts)
            })
            .await
    }
}
