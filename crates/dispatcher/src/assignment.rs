//! 进程内Worker的推送式分配
//!
//! 挂接了收件箱的Worker不需要自己轮询：分配循环为空闲的Worker认领任务，
//! 然后通过容量为1的通道推送过去。推送失败的任务会交还队列。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use orchestrator_core::{ConfigHandle, OrchestratorResult, Task, WorkerStatus};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::engine::TaskEngine;
use crate::registry::WorkerRegistry;

pub struct AssignmentLoop {
    engine: Arc<TaskEngine>,
    registry: Arc<WorkerRegistry>,
    config: ConfigHandle,
    inboxes: Mutex<HashMap<String, mpsc::Sender<Task>>>,
}

impl AssignmentLoop {
    pub fn new(engine: Arc<TaskEngine>, registry: Arc<WorkerRegistry>, config: ConfigHandle) -> Self {
        Self {
            engine,
            registry,
            config,
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    /// 挂接收件箱；同一Worker重复挂接会替换旧的收件箱
    pub fn attach(&self, worker_id: &str) -> mpsc::Receiver<Task> {
        let (tx, rx) = mpsc::channel(1);
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id.to_string(), tx);
        debug!("Worker {} 已挂接收件箱", worker_id);
        rx
    }

    pub fn detach(&self, worker_id: &str) -> bool {
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker_id)
            .is_some()
    }

    pub fn attached(&self) -> usize {
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn inbox(&self, worker_id: &str) -> Option<mpsc::Sender<Task>> {
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .cloned()
    }

    /// 执行一轮分配，返回成功推送的任务数
    pub async fn tick(&self) -> OrchestratorResult<usize> {
        if self.attached() == 0 {
            return Ok(0);
        }

        let mut delivered = 0;
        for worker in self.registry.list_active(None).await? {
            if worker.status != WorkerStatus::Idle || worker.current_task_id.is_some() {
                continue;
            }
            let Some(inbox) = self.inbox(&worker.id) else {
                continue;
            };
            if inbox.is_closed() {
                warn!("Worker {} 的收件箱已关闭，取消挂接", worker.id);
                self.detach(&worker.id);
                continue;
            }
            if inbox.capacity() == 0 {
                continue;
            }

            let Some(task) = self.engine.claim_next(&worker.id, &worker.capabilities).await? else {
                continue;
            };
            if let Err(e) = self.registry.assign(&worker.id, &task.id).await {
                warn!("记录 Worker {} 的当前任务 {} 失败: {}", worker.id, task.id, e);
            }

            if let Err(err) = inbox.try_send(task) {
                let task = err.into_inner();
                warn!("任务 {} 无法推送给 Worker {}，交还队列", task.id, worker.id);
                self.engine.release(&task.id, &worker.id).await?;
                self.registry.release(&worker.id).await?;
                continue;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("启动任务分配循环");
        loop {
            let interval = self.config.current().registry.assignment_interval();
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出任务分配循环");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            match self.tick().await {
                Ok(0) => {}
                Ok(n) => debug!("本轮分配了 {} 个任务", n),
                Err(e) => error!("任务分配时出错: {}", e),
            }
        }
    }
}
