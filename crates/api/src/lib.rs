//! 编排核心的 HTTP API
//!
//! 基于 Axum，把 `Orchestrator` 的操作暴露为 JSON 接口：
//! 任务与计划的创建和状态更新、Worker 注册与心跳、事件回放与死信查询、
//! 系统统计与配置重载。成功响应统一包装为 `ApiResponse`，
//! 错误统一转换为带 `type` 与 `suggestions` 的错误体。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use orchestrator_core::ApiConfig;
use orchestrator_dispatcher::Orchestrator;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(core: Arc<Orchestrator>, api_config: &ApiConfig) -> Router {
    let app = create_routes(AppState { core }).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );
    let app = app.layer(TimeoutLayer::new(Duration::from_secs(
        api_config.request_timeout_seconds,
    )));
    if api_config.cors_enabled {
        app.layer(cors_layer())
    } else {
        app
    }
}
