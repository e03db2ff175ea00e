use axum::{extract::State, response::IntoResponse};
use tracing::info;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 任务计数、熔断器状态、死信数量、Worker与事件总线统计
pub async fn get_system_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.core.get_stats().await?))
}

/// 重新读取配置文件；需要重启才能生效的字段会在结果中列出
pub async fn reload_config(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let outcome = state.core.reload().await?;
    if outcome.changed {
        info!("配置已通过API重新加载");
    }
    Ok(success(outcome))
}
