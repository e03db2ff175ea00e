//! Worker 访问编排核心的客户端
//!
//! - `LocalCoreClient`：同进程内直接调用 `Orchestrator`
//! - `HttpCoreClient`：通过 HTTP API 访问独立部署的核心

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    OrchestratorError, OrchestratorResult, Task, TaskStatus, WorkerInfo, WorkerStatus,
};
use orchestrator_dispatcher::Orchestrator;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[async_trait]
pub trait CoreClient: Send + Sync {
    async fn register(&self, worker_id: &str, capabilities: &[String])
        -> OrchestratorResult<WorkerInfo>;

    async fn heartbeat(&self, worker_id: &str, status: WorkerStatus) -> OrchestratorResult<()>;

    async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>>;

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<bool>;

    /// 交还已认领但未能开始执行的任务，任务已不在本 Worker 手中时返回 false
    async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<bool>;

    async fn is_cancel_requested(&self, task_id: &str) -> OrchestratorResult<bool>;
}

pub struct LocalCoreClient {
    core: Arc<Orchestrator>,
}

impl LocalCoreClient {
    pub fn new(core: Arc<Orchestrator>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl CoreClient for LocalCoreClient {
    async fn register(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<WorkerInfo> {
        self.core.register_worker(worker_id, capabilities.to_vec()).await
    }

    async fn heartbeat(&self, worker_id: &str, status: WorkerStatus) -> OrchestratorResult<()> {
        self.core.heartbeat(worker_id, status).await.map(|_| ())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>> {
        self.core.claim_next(worker_id, capabilities).await
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<bool> {
        self.core.update_status(task_id, status, result).await
    }

    async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<bool> {
        self.core.release_task(task_id, worker_id).await
    }

    async fn is_cancel_requested(&self, task_id: &str) -> OrchestratorResult<bool> {
        self.core.engine().is_cancel_requested(task_id).await
    }
}

/// API 成功响应的外层结构
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct StatusChanged {
    changed: bool,
}

#[derive(Debug, Deserialize)]
struct Released {
    released: bool,
}

pub struct HttpCoreClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpCoreClient {
    pub fn new<S: Into<String>>(base_url: S) -> OrchestratorResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> OrchestratorResult<Option<T>> {
        let status = response.status();
        if status.is_success() {
            let envelope: Envelope<T> = response
                .json()
                .await
                .map_err(|e| OrchestratorError::Serialization(format!("解析响应失败: {e}")))?;
            return Ok(envelope.data);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(ErrorDetail {
                message: body,
                kind: String::new(),
            });
        warn!("核心返回错误: HTTP {} {} {}", status, detail.kind, detail.message);
        Err(status_to_error(status, detail))
    }
}

fn status_to_error(status: StatusCode, detail: ErrorDetail) -> OrchestratorError {
    let ErrorDetail { message, kind } = detail;
    match status {
        StatusCode::NOT_FOUND if kind == "WORKER_NOT_FOUND" => {
            OrchestratorError::WorkerNotFound { id: message }
        }
        StatusCode::NOT_FOUND if kind == "PLAN_NOT_FOUND" => {
            OrchestratorError::PlanNotFound { id: message }
        }
        StatusCode::NOT_FOUND => OrchestratorError::TaskNotFound { id: message },
        StatusCode::CONFLICT => OrchestratorError::Conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            OrchestratorError::Validation(message)
        }
        StatusCode::TOO_MANY_REQUESTS => OrchestratorError::QueueFull { topic: message },
        StatusCode::GATEWAY_TIMEOUT => OrchestratorError::Timeout(message),
        StatusCode::SERVICE_UNAVAILABLE => OrchestratorError::Transient(message),
        _ => OrchestratorError::Internal(format!("HTTP {status}: {message}")),
    }
}

fn transport_error(e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Transient(format!("连接编排核心失败: {e}"))
}

#[async_trait]
impl CoreClient for HttpCoreClient {
    async fn register(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<WorkerInfo> {
        let response = self
            .http_client
            .post(self.url("/api/workers"))
            .json(&json!({ "worker_id": worker_id, "capabilities": capabilities }))
            .send()
            .await
            .map_err(transport_error)?;
        self.decode(response)
            .await?
            .ok_or_else(|| OrchestratorError::internal("注册响应缺少Worker信息"))
    }

    async fn heartbeat(&self, worker_id: &str, status: WorkerStatus) -> OrchestratorResult<()> {
        let response = self
            .http_client
            .post(self.url(&format!("/api/workers/{worker_id}/heartbeat")))
            .json(&json!({ "status": status }))
            .send()
            .await
            .map_err(transport_error)?;
        self.decode::<Value>(response).await?;
        debug!("心跳已发送: {} {}", worker_id, status);
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> OrchestratorResult<Option<Task>> {
        let response = self
            .http_client
            .post(self.url("/api/tasks/claim"))
            .json(&json!({ "worker_id": worker_id, "capabilities": capabilities }))
            .send()
            .await
            .map_err(transport_error)?;
        self.decode(response).await
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
    ) -> OrchestratorResult<bool> {
        let response = self
            .http_client
            .put(self.url(&format!("/api/tasks/{task_id}/status")))
            .json(&json!({ "status": status, "result": result }))
            .send()
            .await
            .map_err(transport_error)?;
        let changed: Option<StatusChanged> = self.decode(response).await?;
        Ok(changed.is_some_and(|c| c.changed))
    }

    async fn release(&self, task_id: &str, worker_id: &str) -> OrchestratorResult<bool> {
        let response = self
            .http_client
            .post(self.url(&format!("/api/tasks/{task_id}/release")))
            .json(&json!({ "worker_id": worker_id }))
            .send()
            .await
            .map_err(transport_error)?;
        let released: Option<Released> = self.decode(response).await?;
        Ok(released.is_some_and(|r| r.released))
    }

    async fn is_cancel_requested(&self, task_id: &str) -> OrchestratorResult<bool> {
        let response = self
            .http_client
            .get(self.url(&format!("/api/tasks/{task_id}")))
            .send()
            .await
            .map_err(transport_error)?;
        let task: Option<Task> = self.decode(response).await?;
        Ok(task.is_some_and(|t| t.cancel_requested))
    }
}
