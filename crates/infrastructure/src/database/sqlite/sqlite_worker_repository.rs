use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{
    OrchestratorError, OrchestratorResult, WorkerInfo, WorkerRepository, WorkerStatus,
};
use sqlx::Row;
use tracing::{debug, instrument};

use crate::database::mapping::{row_to_worker, to_millis};
use crate::database::statements::*;
use crate::database::DatabaseManager;

pub struct SqliteWorkerRepository {
    db: Arc<DatabaseManager>,
}

impl SqliteWorkerRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    #[instrument(skip(self, capabilities))]
    async fn upsert(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<WorkerInfo> {
        let capabilities_json = serde_json::to_string(capabilities).map_err(|e| {
            OrchestratorError::Serialization(format!("序列化能力列表失败: {e}"))
        })?;
        self.db
            .run(|pool| async move {
                let row = sqlx::query(UPSERT_WORKER)
                    .bind(worker_id)
                    .bind(capabilities_json)
                    .bind(to_millis(Utc::now()))
                    .fetch_one(&pool)
                    .await?;
                debug!("注册Worker成功: {}", worker_id);
                row_to_worker(&row)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> OrchestratorResult<WorkerInfo> {
        self.db
            .run(|pool| async move {
                let row = sqlx::query(HEARTBEAT_WORKER)
                    .bind(worker_id)
                    .bind(status.as_str())
                    .bind(to_millis(Utc::now()))
                    .fetch_optional(&pool)
                    .await?;
                match row {
                    Some(row) => row_to_worker(&row),
                    None => Err(OrchestratorError::worker_not_found(worker_id)),
                }
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get(&self, worker_id: &str) -> OrchestratorResult<Option<WorkerInfo>> {
        self.db
            .run(|pool| async move {
                let row = sqlx::query(SELECT_WORKER)
                    .bind(worker_id)
                    .fetch_optional(&pool)
                    .await?;
                row.as_ref().map(row_to_worker).transpose()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_active(
        &self,
        capability: Option<&str>,
        live_since: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<WorkerInfo>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(LIST_ACTIVE_WORKERS)
                    .bind(to_millis(live_since))
                    .bind(capability)
                    .fetch_all(&pool)
                    .await?;
                rows.iter().map(row_to_worker).collect()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn mark_stale_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> OrchestratorResult<Vec<WorkerInfo>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(MARK_STALE_WORKERS_OFFLINE)
                    .bind(to_millis(cutoff))
                    .fetch_all(&pool)
                    .await?;
                rows.iter().map(row_to_worker).collect()
            })
            .await
    }

    async fn offline_task_holders(&self) -> OrchestratorResult<Vec<String>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(SELECT_OFFLINE_TASK_HOLDERS)
                    .fetch_all(&pool)
                    .await?;
                rows.iter()
                    .map(|row| Ok(row.try_get::<String, _>("worker_id")?))
                    .collect()
            })
            .await
    }

    async fn set_current_task(
        &self,
        worker_id: &str,
        task_id: Option<&str>,
    ) -> OrchestratorResult<()> {
        self.db
            .run(|pool| async move {
                sqlx::query(SET_WORKER_CURRENT_TASK)
                    .bind(worker_id)
                    .bind(task_id)
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn count_by_status(&self) -> OrchestratorResult<Vec<(WorkerStatus, u64)>> {
        self.db
            .run(|pool| async move {
                let rows = sqlx::query(COUNT_WORKERS_BY_STATUS)
                    .fetch_all(&pool)
                    .await?;
                rows.iter()
                    .map(|row| {
                        let status: WorkerStatus = row.try_get("status")?;
                        let n: i64 = row.try_get("n")?;
                        Ok((status, n.max(0) as u64))
                    })
                    .collect()
            })
            .await
    }
}
