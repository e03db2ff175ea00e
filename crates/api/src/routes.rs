use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use orchestrator_dispatcher::Orchestrator;

use crate::handlers::{
    events::{list_dead_letters, replay_events, stream_events},
    health::health_check,
    plans::{create_plan, get_plan},
    system::{get_system_stats, reload_config},
    tasks::{cancel_task, claim_task, create_task, get_task, release_task, update_status},
    workers::{heartbeat, list_workers, register_worker},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Orchestrator>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 任务
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/claim", post(claim_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/status", put(update_status))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/release", post(release_task))
        // 计划
        .route("/api/plans", post(create_plan))
        .route("/api/plans/{id}", get(get_plan))
        // Worker
        .route("/api/workers", get(list_workers).post(register_worker))
        .route("/api/workers/{id}/heartbeat", post(heartbeat))
        // 事件
        .route("/api/events/replay", get(replay_events))
        .route("/api/events/dead-letters", get(list_dead_letters))
        .route("/api/events/stream", get(stream_events))
        // 系统
        .route("/api/system/stats", get(get_system_stats))
        .route("/api/system/reload", post(reload_config))
        .with_state(state)
}
