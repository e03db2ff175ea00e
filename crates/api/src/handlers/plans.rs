use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use orchestrator_core::PlanRequest;

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// 校验并原子创建整个计划，任何依赖错误都不会留下部分数据
pub async fn create_plan(
    State(state): State<AppState>,
    payload: Result<Json<PlanRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let plan = state.core.create_plan(request).await?;
    Ok(created(plan))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.core.plan_status(&id).await?))
}
