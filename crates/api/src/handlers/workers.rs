use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::IntoResponse,
    Json,
};
use orchestrator_core::WorkerStatus;
use serde::Deserialize;

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default = "default_heartbeat_status")]
    pub status: WorkerStatus,
}

fn default_heartbeat_status() -> WorkerStatus {
    WorkerStatus::Idle
}

/// Worker查询参数
#[derive(Debug, Deserialize)]
pub struct WorkerQueryParams {
    pub capability: Option<String>,
}

pub async fn register_worker(
    State(state): State<AppState>,
    payload: Result<Json<RegisterWorkerRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let worker = state
        .core
        .register_worker(&request.worker_id, request.capabilities)
        .await?;
    Ok(created(worker))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let worker = state.core.heartbeat(&id, request.status).await?;
    Ok(success(worker))
}

/// 存活窗口内的Worker，可按能力过滤
pub async fn list_workers(
    State(state): State<AppState>,
    Query(params): Query<WorkerQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let workers = state
        .core
        .list_workers(params.capability.as_deref())
        .await?;
    Ok(success(workers))
}
