use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::{error::ApiResult, response::success, routes::AppState};

const DEFAULT_REPLAY_LIMIT: u32 = 100;
const MAX_REPLAY_LIMIT: u32 = 1_000;

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub pattern: Option<String>,
    /// 缺省为一小时前
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub pattern: Option<String>,
}

pub async fn replay_events(
    State(state): State<AppState>,
    query: Result<Query<ReplayQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let pattern = query.pattern.unwrap_or_else(|| "*".to_string());
    let since = query
        .since
        .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(1));
    let limit = query
        .limit
        .unwrap_or(DEFAULT_REPLAY_LIMIT)
        .clamp(1, MAX_REPLAY_LIMIT);

    let events = state.core.replay(&pattern, since, limit).await?;
    Ok(success(events))
}

pub async fn list_dead_letters(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.core.dead_letters()))
}

/// 以 SSE 推送匹配模式的实时事件
pub async fn stream_events(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>> {
    let Query(query) = query?;
    let pattern = query.pattern.unwrap_or_else(|| "*".to_string());
    let events = state.core.subscribe(&pattern).map(|event| {
        SseEvent::default()
            .event(event.topic.clone())
            .id(event.id.clone())
            .json_data(&event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
