use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orchestrator_core::{
    AppConfig, CancelOutcome, CircuitBreaker, ConfigHandle, EventDraft, EventPublisher,
    ExecutionPlan, OrchestratorError, OrchestratorResult, Task, TaskRepository, TaskStatus,
    TaskStatusCounts, TransitionOutcome,
};
use serde_json::Value;
use orchestrator_infrastructure::{DatabaseManager, SqliteTaskRepository, SqliteWorkerRepository};
use tempfile::TempDir;

use crate::engine::TaskEngine;
use crate::registry::WorkerRegistry;

/// 记录所有发布事件的发布器
#[derive(Default)]
pub struct RecordingPublisher {
    drafts: Mutex<Vec<EventDraft>>,
    failing_topic: Mutex<Option<String>>,
}

impl RecordingPublisher {
    /// 之后发布到 `topic` 的事件都返回瞬时错误，传 `None` 恢复
    pub fn fail_on(&self, topic: Option<&str>) {
        *self.failing_topic.lock().unwrap() = topic.map(str::to_string);
    }

    pub fn topics(&self) -> Vec<String> {
        self.drafts
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.topic.clone())
            .collect()
    }

    pub fn with_topic(&self, topic: &str) -> Vec<EventDraft> {
        self.drafts
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.drafts.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, draft: EventDraft) -> OrchestratorResult<String> {
        if self.failing_topic.lock().unwrap().as_deref() == Some(draft.topic.as_str()) {
            return Err(OrchestratorError::transient(format!("发布 {} 失败", draft.topic)));
        }
        self.drafts.lock().unwrap().push(draft);
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// 可注入一次性失败的任务仓储
pub struct FlakyTaskRepository {
    inner: SqliteTaskRepository,
    release_failures: AtomicUsize,
    reclaim_failures: AtomicUsize,
}

impl FlakyTaskRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self {
            inner: SqliteTaskRepository::new(db),
            release_failures: AtomicUsize::new(0),
            reclaim_failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_release(&self, times: usize) {
        self.release_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_reclaim(&self, times: usize) {
        self.reclaim_failures.store(times, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TaskRepository for FlakyTaskRepository {
    async fn insert_tasks(&self, tasks: &[Task]) -> OrchestratorResult<()> {
        self.inner.insert_tasks(tasks).await
    }

    async fn insert_plan(
        &self,
        plan: &ExecutionPlan,
        tasks: &[Task],
        edges: &[(String, String)],
    ) -> OrchestratorResult<()> {
        self.inner.insert_plan(plan, tasks, edges).await
    }

    async fn get(&self, task_id: &str) -> OrchestratorResult<Option<Task>> {
        self.inner.get(task_id).await
    }

    async fn get_plan(&self, plan_id: &str) -> OrchestratorResult<Option<ExecutionPlan>> {
        self.inner.get_plan(plan_id).await
    }

    async fn plan_tasks(&self, plan_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.inner.plan_tasks(plan_id).await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>> {
        self.inner.claim_next(worker_id, capabilities).await
    }

    async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<TransitionOutcome> {
        self.inner.transition(task_id, target, result).await
    }

    async fn transition_batch(
        &self,
        task_ids: &[String],
        target: TaskStatus,
    ) -> OrchestratorResult<Vec<TransitionOutcome>> {
        self.inner.transition_batch(task_ids, target).await
    }

    async fn request_cancel(&self, task_id: &str) -> OrchestratorResult<CancelOutcome> {
        self.inner.request_cancel(task_id).await
    }

    async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<Option<Task>> {
        if Self::take_failure(&self.release_failures) {
            return Err(OrchestratorError::transient("数据库繁忙"));
        }
        self.inner.release(task_id, worker_id).await
    }

    async fn reclaim_worker_tasks(&self, worker_id: &str) -> OrchestratorResult<Vec<Task>> {
        if Self::take_failure(&self.reclaim_failures) {
            return Err(OrchestratorError::transient("数据库繁忙"));
        }
        self.inner.reclaim_worker_tasks(worker_id).await
    }

    async fn ready_dependents(&self, task_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.inner.ready_dependents(task_id).await
    }

    async fn mark_plan_finished(&self, plan_id: &str) -> OrchestratorResult<bool> {
        self.inner.mark_plan_finished(plan_id).await
    }

    async fn status_counts(&self) -> OrchestratorResult<TaskStatusCounts> {
        self.inner.status_counts().await
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub db: Arc<DatabaseManager>,
    pub events: Arc<RecordingPublisher>,
    pub tasks: Arc<FlakyTaskRepository>,
    pub engine: Arc<TaskEngine>,
    pub registry: Arc<WorkerRegistry>,
    pub config: ConfigHandle,
}

pub async fn fixture() -> Fixture {
    fixture_with(AppConfig::default()).await
}

pub async fn fixture_with(mut config: AppConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    config.database.url = format!("sqlite://{}", dir.path().join("engine.db").display());
    let db = Arc::new(
        DatabaseManager::connect(&config.database, CircuitBreaker::new())
            .await
            .unwrap(),
    );
    let config = ConfigHandle::fixed(config);
    let events = Arc::new(RecordingPublisher::default());
    let tasks = Arc::new(FlakyTaskRepository::new(db.clone()));
    let engine = Arc::new(TaskEngine::new(
        tasks.clone(),
        events.clone(),
        config.clone(),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::new(SqliteWorkerRepository::new(db.clone())),
        engine.clone(),
        events.clone(),
        config.clone(),
    ));
    Fixture {
        _dir: dir,
        db,
        events,
        tasks,
        engine,
        registry,
        config,
    }
}

pub fn caps(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
