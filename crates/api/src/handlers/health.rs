use axum::{extract::State, Json};
use orchestrator_core::CircuitState;
use serde_json::{json, Value};

use crate::routes::AppState;

/// 熔断器打开时报告 degraded，进程本身仍然存活
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let breaker = state.core.database().breaker().state().await;
    let status = if breaker == CircuitState::Open {
        "degraded"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "breaker_state": breaker,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "orchestrator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
