use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use orchestrator_core::OrchestratorError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("编排核心错误: {0}")]
    Core(#[from] OrchestratorError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求体解析失败: {0}")]
    Json(#[from] JsonRejection),

    #[error("查询参数解析失败: {0}")]
    Query(#[from] QueryRejection),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, String, &'static str, Vec<&'static str>) {
        use OrchestratorError as E;
        match self {
            ApiError::Core(err) => match err {
                E::TaskNotFound { id } => (
                    StatusCode::NOT_FOUND,
                    id.clone(),
                    "TASK_NOT_FOUND",
                    vec!["请检查任务ID是否正确"],
                ),
                E::PlanNotFound { id } => (
                    StatusCode::NOT_FOUND,
                    id.clone(),
                    "PLAN_NOT_FOUND",
                    vec!["请检查计划ID是否正确"],
                ),
                E::WorkerNotFound { id } => (
                    StatusCode::NOT_FOUND,
                    id.clone(),
                    "WORKER_NOT_FOUND",
                    vec![
                        "请先通过 POST /api/workers 注册",
                        "使用 GET /api/workers 查看在线Worker",
                    ],
                ),
                E::InvalidTransition { .. } => (
                    StatusCode::CONFLICT,
                    err.to_string(),
                    "INVALID_TRANSITION",
                    vec!["使用 GET /api/tasks/{id} 查看任务当前状态"],
                ),
                E::Conflict(msg) => (
                    StatusCode::CONFLICT,
                    msg.clone(),
                    "CONFLICT",
                    vec!["稍后重试"],
                ),
                E::Validation(msg) => (
                    StatusCode::BAD_REQUEST,
                    msg.clone(),
                    "VALIDATION_ERROR",
                    vec!["请检查请求参数是否符合要求"],
                ),
                E::CyclicDependency { .. } => (
                    StatusCode::BAD_REQUEST,
                    err.to_string(),
                    "CYCLIC_DEPENDENCY",
                    vec!["请检查计划内的依赖关系，确保没有循环依赖"],
                ),
                E::UnknownDependency { .. } => (
                    StatusCode::BAD_REQUEST,
                    err.to_string(),
                    "UNKNOWN_DEPENDENCY",
                    vec!["依赖只能引用同一计划内的任务"],
                ),
                E::CircuitOpen { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    err.to_string(),
                    "CIRCUIT_OPEN",
                    vec!["持久化层暂时不可用，请稍后重试"],
                ),
                E::Transient(msg) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    msg.clone(),
                    "TRANSIENT",
                    vec!["请稍后重试"],
                ),
                E::QueueFull { topic } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    topic.clone(),
                    "QUEUE_FULL",
                    vec!["事件队列已满，请降低请求速率"],
                ),
                E::Timeout(msg) => (
                    StatusCode::GATEWAY_TIMEOUT,
                    msg.clone(),
                    "TIMEOUT",
                    vec!["请稍后重试"],
                ),
                E::Database(_) | E::Serialization(_) | E::Configuration(_) | E::Internal(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                    "INTERNAL_ERROR",
                    vec!["请查看服务端日志"],
                ),
            },
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                msg.clone(),
                "BAD_REQUEST",
                vec!["请检查请求参数"],
            ),
            ApiError::Json(rejection) => (
                StatusCode::BAD_REQUEST,
                rejection.body_text(),
                "INVALID_JSON",
                vec!["请检查请求体是否为合法的JSON"],
            ),
            ApiError::Query(rejection) => (
                StatusCode::BAD_REQUEST,
                rejection.body_text(),
                "INVALID_QUERY",
                vec!["请检查查询参数"],
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                msg.clone(),
                "INTERNAL_ERROR",
                vec!["请查看服务端日志"],
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_type, suggestions) = self.parts();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "documentation": "/api/docs"
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status_of(err: OrchestratorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_core_errors_map_to_http_status() {
        assert_eq!(
            status_of(OrchestratorError::task_not_found("t1")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(OrchestratorError::InvalidTransition {
                task_id: "t1".into(),
                from: "completed".into(),
                to: "running".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(OrchestratorError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()],
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrchestratorError::CircuitOpen {
                retry_after: Duration::from_secs(5),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(OrchestratorError::QueueFull {
                topic: "task.created".into(),
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(OrchestratorError::Timeout("wait_for".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(OrchestratorError::Database("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::from(OrchestratorError::worker_not_found("w9")).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "WORKER_NOT_FOUND");
        assert_eq!(body["error"]["message"], "w9");
        assert_eq!(body["error"]["code"], 404);
        assert!(body["error"]["suggestions"].is_array());
    }
}
