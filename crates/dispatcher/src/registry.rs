//! Worker注册中心
//!
//! 注册中心只提供参考信息：任务归属以任务表为准，认领的排他性由任务引擎的条件更新保证。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orchestrator_core::{
    topics, ConfigHandle, EventDraft, EventPriority, EventPublisher, OrchestratorError,
    OrchestratorResult, WorkerInfo, WorkerRepository, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::TaskEngine;

/// 一次回收的结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReapReport {
    /// 被标记为 offline 的 Worker
    pub workers: Vec<String>,
    /// 重新排队或取消的任务
    pub reclaimed_tasks: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.reclaimed_tasks.is_empty()
    }
}

pub struct WorkerRegistry {
    repo: Arc<dyn WorkerRepository>,
    engine: Arc<TaskEngine>,
    events: Arc<dyn EventPublisher>,
    config: ConfigHandle,
}

impl WorkerRegistry {
    pub fn new(
        repo: Arc<dyn WorkerRepository>,
        engine: Arc<TaskEngine>,
        events: Arc<dyn EventPublisher>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            repo,
            engine,
            events,
            config,
        }
    }

    /// 注册或重新注册Worker
    ///
    /// 重新注册意味着上一个进程实例已经不在了，它名下残留的任务会先被回收。
    #[instrument(skip(self, capabilities))]
    pub async fn register(
        &self,
        worker_id: &str,
        capabilities: Vec<String>,
    ) -> OrchestratorResult<WorkerInfo> {
        if worker_id.trim().is_empty() {
            return Err(OrchestratorError::validation("Worker ID不能为空"));
        }
        let capabilities: Vec<String> = capabilities
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let leftovers = self.engine.reclaim_worker_tasks(worker_id).await?;
        if !leftovers.is_empty() {
            warn!(
                "Worker {} 重新注册，回收了上一实例遗留的 {} 个任务",
                worker_id,
                leftovers.len()
            );
        }

        let worker = self.repo.upsert(worker_id, &capabilities).await?;
        self.events
            .publish(
                EventDraft::new(
                    topics::AGENT_STARTED,
                    json!({
                        "worker_id": worker.id,
                        "capabilities": worker.capabilities,
                    }),
                )
                .with_correlation_id(Some(worker.id.clone())),
            )
            .await?;
        info!("Worker已注册: {} {:?}", worker.id, worker.capabilities);
        Ok(worker)
    }

    /// 刷新心跳，只接受 active / idle
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> OrchestratorResult<WorkerInfo> {
        if status == WorkerStatus::Offline {
            return Err(OrchestratorError::validation(
                "心跳状态只能是 active 或 idle",
            ));
        }
        let worker = self.repo.heartbeat(worker_id, status).await?;
        debug!("Worker心跳: {} {}", worker_id, status);
        Ok(worker)
    }

    /// 早于该时间的心跳视为过期
    fn liveness_cutoff(&self) -> OrchestratorResult<DateTime<Utc>> {
        let window = self.config.current().registry.liveness_window();
        let window = ChronoDuration::from_std(window)
            .map_err(|e| OrchestratorError::Configuration(format!("存活窗口无效: {e}")))?;
        Ok(Utc::now() - window)
    }

    pub async fn get(&self, worker_id: &str) -> OrchestratorResult<WorkerInfo> {
        self.repo
            .get(worker_id)
            .await?
            .ok_or_else(|| OrchestratorError::worker_not_found(worker_id))
    }

    /// 存活窗口内有心跳、能处理 `capability` 的Worker
    pub async fn list_active(&self, capability: Option<&str>) -> OrchestratorResult<Vec<WorkerInfo>> {
        let live_since = self.liveness_cutoff()?;
        self.repo.list_active(capability, live_since).await
    }

    pub async fn assign(&self, worker_id: &str, task_id: &str) -> OrchestratorResult<()> {
        self.repo.set_current_task(worker_id, Some(task_id)).await
    }

    pub async fn release(&self, worker_id: &str) -> OrchestratorResult<()> {
        self.repo.set_current_task(worker_id, None).await
    }

    /// 把心跳超时的Worker标记为 offline 并回收它们持有的任务
    ///
    /// 标记是一条条件更新，同一个Worker只会被标记一次；标记后回收失败的任务由后续轮次补扫。
    #[instrument(skip(self))]
    pub async fn reap_stale(&self) -> OrchestratorResult<ReapReport> {
        let cutoff = self.liveness_cutoff()?;
        let stale = self.repo.mark_stale_offline(cutoff).await?;

        let mut report = ReapReport::default();
        let mut first_error = None;
        for worker in stale {
            warn!(
                "Worker心跳超时，标记为离线: {} (上次心跳: {})",
                worker.id,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );
            let reclaimed = match self.engine.reclaim_worker_tasks(&worker.id).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("回收Worker {} 的任务失败: {}", worker.id, e);
                    first_error.get_or_insert(e);
                    Vec::new()
                }
            };

            let notice = EventDraft::new(
                topics::AGENT_STOPPED,
                json!({
                    "worker_id": worker.id,
                    "reason": "heartbeat_timeout",
                    "last_heartbeat": worker.last_heartbeat,
                    "reclaimed_tasks": reclaimed,
                }),
            )
            .with_priority(EventPriority::High)
            .with_correlation_id(Some(worker.id.clone()));
            if let Err(e) = self.events.publish(notice).await {
                first_error.get_or_insert(e);
            }

            report.reclaimed_tasks.extend(reclaimed);
            report.workers.push(worker.id);
        }

        // 之前回收失败的离线Worker不会再被标记，每轮补扫它们名下的任务
        match self.repo.offline_task_holders().await {
            Ok(holders) => {
                for worker_id in holders {
                    match self.engine.reclaim_worker_tasks(&worker_id).await {
                        Ok(ids) => {
                            if !ids.is_empty() {
                                warn!("补回收离线Worker {} 的 {} 个任务", worker_id, ids.len());
                            }
                            report.reclaimed_tasks.extend(ids);
                        }
                        Err(e) => {
                            error!("补回收离线Worker {} 的任务失败: {}", worker_id, e);
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("查询离线Worker遗留任务失败: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if !report.is_empty() {
            metrics::counter!("orchestrator_workers_reaped_total")
                .increment(report.workers.len() as u64);
            info!(
                "回收完成: {} 个离线Worker，{} 个任务",
                report.workers.len(),
                report.reclaimed_tasks.len()
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    pub async fn counts(&self) -> OrchestratorResult<BTreeMap<String, u64>> {
        let mut counts: BTreeMap<String, u64> = [
            WorkerStatus::Active,
            WorkerStatus::Idle,
            WorkerStatus::Offline,
        ]
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
        for (status, count) in self.repo.count_by_status().await? {
            counts.insert(status.as_str().to_string(), count);
        }
        Ok(counts)
    }
}
