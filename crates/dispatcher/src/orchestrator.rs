//! 编排核心的组装与对外入口
//!
//! 进程启动时构造一个持久化层、一个事件总线、一个任务引擎和一个注册中心，
//! 通过引用向下传递，不使用全局单例。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use orchestrator_core::{
    AppConfig, CancelOutcome, CircuitBreaker, CircuitBreakerSnapshot, CircuitState, ConfigHandle,
    Event, EventPublisher, EventStore, NewTask, OrchestratorResult, PlanCreated, PlanRequest,
    PlanView, ReloadOutcome, Task, TaskStatus, TaskStatusCounts, WorkerInfo, WorkerStatus,
};
use orchestrator_infrastructure::{
    DatabaseManager, DeadLetter, EventBus, EventBusStats, PoolStats, SqliteEventStore,
    SqliteTaskRepository, SqliteWorkerRepository,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::assignment::AssignmentLoop;
use crate::engine::TaskEngine;
use crate::reaper::Reaper;
use crate::registry::{ReapReport, WorkerRegistry};

/// 管理接口返回的系统统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub queued: u64,
    pub assigned: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub breaker_state: CircuitState,
    pub breaker: CircuitBreakerSnapshot,
    pub dead_letters: usize,
    pub workers: BTreeMap<String, u64>,
    pub event_bus: EventBusStats,
    pub pool: PoolStats,
    pub collected_at: DateTime<Utc>,
}

pub struct Orchestrator {
    config: ConfigHandle,
    db: Arc<DatabaseManager>,
    bus: EventBus,
    engine: Arc<TaskEngine>,
    registry: Arc<WorkerRegistry>,
    assignment: Arc<AssignmentLoop>,
    store: Option<Arc<dyn EventStore>>,
}

impl Orchestrator {
    /// 连接数据库、执行迁移并启动事件总线
    pub async fn start(config: ConfigHandle) -> OrchestratorResult<Self> {
        let current = config.current();
        let breaker = CircuitBreaker::with_config(current.resilience.breaker_config());
        let db = Arc::new(DatabaseManager::connect(&current.database, breaker).await?);

        let store: Option<Arc<dyn EventStore>> = if current.event_bus.durable_log {
            Some(Arc::new(SqliteEventStore::new(db.clone())))
        } else {
            None
        };
        let bus = EventBus::start(&current.event_bus, store.clone());
        let events: Arc<dyn EventPublisher> = Arc::new(bus.clone());

        let engine = Arc::new(TaskEngine::new(
            Arc::new(SqliteTaskRepository::new(db.clone())),
            events.clone(),
            config.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(SqliteWorkerRepository::new(db.clone())),
            engine.clone(),
            events,
            config.clone(),
        ));
        let assignment = Arc::new(AssignmentLoop::new(
            engine.clone(),
            registry.clone(),
            config.clone(),
        ));

        info!("编排核心已启动: database={}", current.database.url);
        Ok(Self {
            config,
            db,
            bus,
            engine,
            registry,
            assignment,
            store,
        })
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn database(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn assignment(&self) -> &Arc<AssignmentLoop> {
        &self.assignment
    }

    pub async fn create_task(&self, request: NewTask) -> OrchestratorResult<String> {
        self.engine.create_task(request).await
    }

    pub async fn batch_create_tasks(&self, requests: Vec<NewTask>) -> OrchestratorResult<Vec<String>> {
        self.engine.batch_create(requests).await
    }

    pub async fn create_plan(&self, request: PlanRequest) -> OrchestratorResult<PlanCreated> {
        self.engine.create_plan(request).await
    }

    /// 为 Worker 认领下一个任务并记录到注册中心
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>> {
        let task = self.engine.claim_next(worker_id, capabilities).await?;
        if let Some(task) = &task {
            // 当前任务只是参考信息，认领已生效时不因它失败
            if let Err(e) = self.registry.assign(worker_id, &task.id).await {
                warn!("记录 Worker {} 的当前任务 {} 失败: {}", worker_id, task.id, e);
            }
        }
        Ok(task)
    }

    /// 更新任务状态；任务离开 Worker 时同步清理注册中心的当前任务
    #[instrument(skip(self, result))]
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<bool> {
        let change = self.engine.transition(task_id, status, result).await?;
        if change.applied && !change.task.status.is_held() {
            if let Some(worker_id) = change.previous_assignee.as_deref() {
                self.registry.release(worker_id).await?;
            }
        }
        Ok(change.applied)
    }

    /// Worker 交还一个尚未开始执行的任务
    pub async fn release_task(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<bool> {
        let released = self.engine.release(task_id, worker_id).await?;
        if released {
            if let Err(e) = self.registry.release(worker_id).await {
                warn!("清理 Worker {} 的当前任务失败: {}", worker_id, e);
            }
        }
        Ok(released)
    }

    pub async fn cancel_task(&self, task_id: &str) -> OrchestratorResult<CancelOutcome> {
        let outcome = self.engine.cancel(task_id).await?;
        if let CancelOutcome::Cancelled(task) = &outcome {
            debug!("任务 {} 已取消", task.id);
        }
        Ok(outcome)
    }

    pub async fn get_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.engine.get_task(task_id).await
    }

    pub async fn plan_status(&self, plan_id: &str) -> OrchestratorResult<PlanView> {
        self.engine.plan_status(plan_id).await
    }

    pub async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: Vec<String>,
    ) -> OrchestratorResult<WorkerInfo> {
        self.registry.register(worker_id, capabilities).await
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> OrchestratorResult<WorkerInfo> {
        self.registry.heartbeat(worker_id, status).await
    }

    pub async fn list_workers(&self, capability: Option<&str>) -> OrchestratorResult<Vec<WorkerInfo>> {
        self.registry.list_active(capability).await
    }

    pub async fn reap_stale(&self) -> OrchestratorResult<ReapReport> {
        self.registry.reap_stale().await
    }

    /// 只读事件流
    pub fn subscribe(&self, pattern: &str) -> impl Stream<Item = Event> + Send + 'static {
        self.bus.stream(pattern)
    }

    pub async fn replay(
        &self,
        pattern: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> OrchestratorResult<Vec<Event>> {
        self.bus.replay_limited(pattern, since, limit).await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.bus.dead_letters()
    }

    pub async fn get_stats(&self) -> OrchestratorResult<SystemStats> {
        let TaskStatusCounts {
            queued,
            assigned,
            running,
            completed,
            failed,
            cancelled,
        } = self.engine.status_counts().await?;
        let breaker = self.db.breaker().snapshot().await;
        Ok(SystemStats {
            queued,
            assigned,
            running,
            completed,
            failed,
            cancelled,
            breaker_state: breaker.state,
            breaker,
            dead_letters: self.bus.dead_letter_count(),
            workers: self.registry.counts().await?,
            event_bus: self.bus.stats(),
            pool: self.db.pool_stats(),
            collected_at: Utc::now(),
        })
    }

    /// 重新加载配置并推送给熔断器和事件总线
    pub async fn reload(&self) -> OrchestratorResult<ReloadOutcome> {
        let outcome = self.config.reload()?;
        if outcome.changed {
            self.apply_config(&self.config.current()).await;
        }
        Ok(outcome)
    }

    pub async fn apply_config(&self, config: &AppConfig) {
        self.db
            .breaker()
            .update_config(config.resilience.breaker_config())
            .await;
        self.bus.apply_config(&config.event_bus);
    }

    /// 启动回收循环、分配循环和配置推送循环
    pub fn spawn_background(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut reaper = Reaper::new(self.registry.clone(), self.config.clone());
        if let Some(store) = &self.store {
            reaper = reaper.with_event_store(store.clone());
        }
        let mut handles = vec![
            tokio::spawn(reaper.run(shutdown.subscribe())),
            tokio::spawn(self.assignment.clone().run(shutdown.subscribe())),
        ];

        let this = self.clone();
        let mut stop = shutdown.subscribe();
        let mut changes = self.config.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let config = changes.borrow_and_update().clone();
                        this.apply_config(&config).await;
                        debug!("运行时配置已推送给熔断器和事件总线");
                    }
                }
            }
        }));
        handles
    }

    /// 停止事件总线并关闭连接池
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
        self.db.close().await;
        info!("编排核心已停止");
    }
}
