use std::time::{Duration, Instant};

use axum::{extract::Request, http::Method, middleware::Next, response::Response};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

/// 超过该耗时的请求以 warn 级别记录
const SLOW_REQUEST: Duration = Duration::from_secs(1);

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let elapsed = start.elapsed();

    metrics::counter!(
        "orchestrator_http_requests_total",
        "method" => method.to_string(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!("orchestrator_http_request_duration_seconds").record(elapsed.as_secs_f64());

    if elapsed > SLOW_REQUEST {
        warn!(
            "慢请求: {} {} - 状态: {} - 耗时: {:?}",
            method,
            uri,
            response.status(),
            elapsed
        );
    } else {
        debug!(
            "完成请求处理: {} {} - 状态: {} - 耗时: {:?}",
            method,
            uri,
            response.status(),
            elapsed
        );
    }

    response
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any)
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}
