//! Worker 运行时
//!
//! 注册后维持心跳，通过轮询 `claim_next` 或分配循环推送的收件箱获取任务，
//! 每次只执行一个任务并把结果回报给编排核心。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{
    OrchestratorError, OrchestratorResult, Task, TaskStatus, WorkerInfo, WorkerRuntimeConfig,
    WorkerStatus,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::client::CoreClient;
use crate::executor::{ExecutionContext, ExecutionError, ExecutorRegistry};

const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_MAX: Duration = Duration::from_secs(5);
const RETRY_MIN: Duration = Duration::from_millis(50);

/// 主机名加进程号
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

pub struct WorkerRuntime {
    worker_id: String,
    capabilities: Vec<String>,
    client: Arc<dyn CoreClient>,
    executors: ExecutorRegistry,
    config: WorkerRuntimeConfig,
    busy: Arc<AtomicBool>,
    inbox: Option<mpsc::Receiver<Task>>,
}

impl WorkerRuntime {
    pub fn new(
        client: Arc<dyn CoreClient>,
        executors: ExecutorRegistry,
        config: WorkerRuntimeConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_worker_id);
        Self {
            worker_id,
            capabilities: config.capabilities.clone(),
            client,
            executors,
            config,
            busy: Arc::new(AtomicBool::new(false)),
            inbox: None,
        }
    }

    /// 从分配循环接收任务，不再自行轮询
    pub fn with_inbox(mut self, inbox: mpsc::Receiver<Task>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub async fn register(&self) -> OrchestratorResult<WorkerInfo> {
        let info = self
            .client
            .register(&self.worker_id, &self.capabilities)
            .await?;
        info!(
            "Worker {} 注册成功，能力: {:?}",
            self.worker_id, info.capabilities
        );
        Ok(info)
    }

    /// 运行到收到关闭信号为止；当前任务会先执行完
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> OrchestratorResult<()> {
        self.register().await?;
        let heartbeat = self.spawn_heartbeat(shutdown.resubscribe());
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut inbox = self.inbox.take();

        loop {
            if stop_requested(&mut shutdown) {
                break;
            }

            let next = match inbox.as_mut() {
                Some(rx) => {
                    let received = tokio::select! {
                        _ = shutdown.recv() => break,
                        task = rx.recv() => task,
                    };
                    if received.is_none() {
                        warn!("Worker {} 的收件箱已关闭，改为轮询", self.worker_id);
                        inbox = None;
                        continue;
                    }
                    received
                }
                None => match self.claim().await {
                    Some(task) => Some(task),
                    None => {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = sleep(poll_interval) => continue,
                        }
                    }
                },
            };

            if let Some(task) = next {
                self.execute(task).await;
            }
        }

        info!("Worker {} 正在停止", self.worker_id);
        if let Err(e) = heartbeat.await {
            warn!("心跳任务异常退出: {}", e);
        }
        Ok(())
    }

    /// 认领并执行一个任务，返回是否拿到了任务
    pub async fn poll_once(&self) -> bool {
        match self.claim().await {
            Some(task) => {
                self.execute(task).await;
                true
            }
            None => false,
        }
    }

    async fn claim(&self) -> Option<Task> {
        match self
            .client
            .claim_next(&self.worker_id, &self.capabilities)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                warn!("Worker {} 认领任务失败: {}", self.worker_id, e);
                None
            }
        }
    }

    fn spawn_heartbeat(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let client = self.client.clone();
        let worker_id = self.worker_id.clone();
        let busy = self.busy.clone();
        let mut ticker = interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = if busy.load(Ordering::Relaxed) {
                            WorkerStatus::Active
                        } else {
                            WorkerStatus::Idle
                        };
                        if let Err(e) = client.heartbeat(&worker_id, status).await {
                            error!("发送心跳失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳任务停止: {}", worker_id);
                        break;
                    }
                }
            }
        })
    }

    /// 执行期间定期检查取消标记
    fn spawn_cancel_watch(&self, task_id: String, flag: watch::Sender<bool>) -> JoinHandle<()> {
        let client = self.client.clone();
        let period = Duration::from_millis(self.config.cancel_check_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                sleep(period).await;
                match client.is_cancel_requested(&task_id).await {
                    Ok(true) => {
                        info!("任务 {} 收到取消请求", task_id);
                        let _ = flag.send(true);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => debug!("检查取消标记失败: {} {}", task_id, e),
                }
            }
        })
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    async fn execute(&self, task: Task) {
        self.busy.store(true, Ordering::Relaxed);
        let task_id = task.id.clone();

        if let Err(e) = self
            .client
            .update_status(&task_id, TaskStatus::Running, None)
            .await
        {
            warn!("任务 {} 无法进入运行状态: {}", task_id, e);
            self.give_back(&task_id).await;
            self.busy.store(false, Ordering::Relaxed);
            return;
        }

        let Some(executor) = self.executors.get(&task.task_type) else {
            error!("没有找到任务类型 '{}' 的执行器", task.task_type);
            self.report(
                &task_id,
                TaskStatus::Failed,
                Some(json!({ "error": format!("不支持的任务类型: {}", task.task_type) })),
            )
            .await;
            self.busy.store(false, Ordering::Relaxed);
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(task.cancel_requested);
        let watcher = self.spawn_cancel_watch(task_id.clone(), cancel_tx);
        let ctx = ExecutionContext::new(self.worker_id.clone(), cancel_rx);

        info!("开始执行任务: {} (执行器 {})", task_id, executor.name());
        let run_ctx = ctx.clone();
        let outcome = tokio::spawn(async move { executor.execute(&task, &run_ctx).await }).await;
        watcher.abort();

        let (status, result) = match outcome {
            _ if ctx.is_cancelled() => (TaskStatus::Cancelled, None),
            Ok(Err(ExecutionError::Cancelled)) => (TaskStatus::Cancelled, None),
            Ok(Ok(output)) => (TaskStatus::Completed, Some(output)),
            Ok(Err(e)) => (TaskStatus::Failed, Some(json!({ "error": e.to_string() }))),
            Err(join_err) => {
                error!("执行器异常退出: {}", join_err);
                (
                    TaskStatus::Failed,
                    Some(json!({ "error": format!("执行器异常退出: {join_err}") })),
                )
            }
        };
        info!("任务 {} 执行结束: {}", task_id, status);
        self.report(&task_id, status, result).await;
        self.busy.store(false, Ordering::Relaxed);
    }

    /// 回报最终状态，瞬时错误一直重试到 `report_deadline` 为止
    async fn report(&self, task_id: &str, status: TaskStatus, result: Option<Value>) {
        let client = &self.client;
        let outcome = self
            .retry_until_deadline("回报任务状态", move || {
                client.update_status(task_id, status, result.clone())
            })
            .await;
        match outcome {
            Ok(true) => {}
            Ok(false) => debug!("任务 {} 已处于 {}", task_id, status),
            Err(OrchestratorError::InvalidTransition { .. }) => {
                warn!("任务 {} 已被编排核心收回，放弃回报 {}", task_id, status);
            }
            Err(e) => error!("回报任务 {} 状态 {} 失败，已放弃: {}", task_id, status, e),
        }
    }

    /// 把认领后没能开始执行的任务交还队列
    async fn give_back(&self, task_id: &str) {
        let client = &self.client;
        let worker_id = self.worker_id.as_str();
        let outcome = self
            .retry_until_deadline("交还任务", move || client.release(task_id, worker_id))
            .await;
        match outcome {
            Ok(true) => info!("任务 {} 已交还队列", task_id),
            Ok(false) => debug!("任务 {} 已不在 Worker {} 名下", task_id, worker_id),
            Err(e) => error!("交还任务 {} 失败: {}", task_id, e),
        }
    }

    async fn retry_until_deadline<T, F, Fut>(&self, what: &str, mut op: F) -> OrchestratorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let deadline = Instant::now() + self.config.report_deadline();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if should_retry(&e) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(e);
                    }
                    let wait = retry_delay(&e, attempt).min(remaining);
                    warn!("{}失败(第{}次)，{:?} 后重试: {}", what, attempt, wait, e);
                    sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

/// 409 也可能是非法状态转换，不在重试之列
fn should_retry(e: &OrchestratorError) -> bool {
    matches!(
        e,
        OrchestratorError::Transient(_)
            | OrchestratorError::Timeout(_)
            | OrchestratorError::CircuitOpen { .. }
            | OrchestratorError::QueueFull { .. }
    )
}

/// 熔断时等到熔断器半开，其余按指数退避
fn retry_delay(e: &OrchestratorError, attempt: u32) -> Duration {
    match e {
        OrchestratorError::CircuitOpen { retry_after } => (*retry_after).max(RETRY_MIN),
        _ => RETRY_BASE
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(5))
            .min(RETRY_MAX),
    }
}

fn stop_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}
