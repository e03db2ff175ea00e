use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use orchestrator_core::{CancelOutcome, NewTask, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    response::{accepted, created, success},
    routes::AppState,
};

/// 认领请求
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// 状态更新请求
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdateResponse {
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub worker_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// 创建任务，单个对象或数组
pub async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = payload?;
    if body.is_array() {
        let requests: Vec<NewTask> = serde_json::from_value(body)
            .map_err(|e| ApiError::BadRequest(format!("任务列表格式错误: {e}")))?;
        let ids = state.core.batch_create_tasks(requests).await?;
        return Ok(created(json!({ "task_ids": ids })));
    }

    let request: NewTask = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("任务格式错误: {e}")))?;
    let id = state.core.create_task(request).await?;
    Ok(created(json!({ "task_id": id })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.core.get_task(&id).await?;
    Ok(success(task))
}

/// 没有可认领任务时 `data` 为 null
pub async fn claim_task(
    State(state): State<AppState>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state
        .core
        .claim_next(&request.worker_id, &request.capabilities)
        .await?;
    Ok(success(task))
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let changed = state
        .core
        .update_status(&id, request.status, request.result)
        .await?;
    Ok(success(StatusUpdateResponse { changed }))
}

/// 任务不再由该 Worker 持有或已开始执行时 `released` 为 false
pub async fn release_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ReleaseRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let released = state.core.release_task(&id, &request.worker_id).await?;
    Ok(success(ReleaseResponse { released }))
}

/// queued / assigned 立即取消；running 只打标记，返回 202
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<axum::response::Response> {
    let response = match state.core.cancel_task(&id).await? {
        CancelOutcome::Cancelled(task) => {
            success(json!({ "outcome": "cancelled", "task": task })).into_response()
        }
        CancelOutcome::Flagged(task) => {
            accepted(json!({ "outcome": "cancel_requested", "task": task })).into_response()
        }
        CancelOutcome::AlreadyFinished(task) => {
            success(json!({ "outcome": "already_finished", "task": task })).into_response()
        }
    };
    Ok(response)
}
