use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use orchestrator_api::create_app;
use orchestrator_core::{AppConfig, ConfigHandle};
use orchestrator_dispatcher::Orchestrator;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _dir: TempDir,
    core: Arc<Orchestrator>,
    router: Router,
}

impl TestApp {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.url = format!("sqlite://{}", dir.path().join("api.db").display());
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let core = Arc::new(
            Orchestrator::start(ConfigHandle::new(config.clone(), Some(path)))
                .await
                .unwrap(),
        );
        let router = create_app(core.clone(), &config.api);
        Self {
            _dir: dir,
            core,
            router,
        }
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body)).await
    }

    async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::PUT, uri, Some(body)).await
    }

    async fn create_task(&self, task_type: &str) -> String {
        let (status, body) = self
            .post("/api/tasks", json!({ "task_type": task_type, "payload": {}, "priority": 1 }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["task_id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::spawn().await;
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["breaker_state"], "closed");
}

#[tokio::test]
async fn test_create_and_get_task() {
    let app = TestApp::spawn().await;
    let id = app.create_task("review").await;

    let (status, body) = app.get(&format!("/api/tasks/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "queued");
    assert_eq!(body["data"]["task_type"], "review");
    assert_eq!(body["data"]["max_retries"], 3);
}

#[tokio::test]
async fn test_batch_create_tasks() {
    let app = TestApp::spawn().await;
    let (status, body) = app
        .post(
            "/api/tasks",
            json!([
                { "task_type": "lint" },
                { "task_type": "test", "priority": 5, "max_retries": 0 }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["task_ids"].as_array().unwrap().len(), 2);
    assert_eq!(app.core.get_stats().await.unwrap().queued, 2);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let app = TestApp::spawn().await;

    let (status, body) = app.post("/api/tasks", json!({ "task_type": "  " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "VALIDATION_ERROR");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/workers")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = app.get("/api/tasks/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "TASK_NOT_FOUND");
    assert_eq!(body["error"]["code"], 404);
}

#[tokio::test]
async fn test_claim_and_status_lifecycle() {
    let app = TestApp::spawn().await;
    let (status, body) = app
        .post("/api/workers", json!({ "worker_id": "w1", "capabilities": ["build"] }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "idle");

    let id = app.create_task("build").await;
    let claim = json!({ "worker_id": "w1", "capabilities": ["build"] });
    let (status, body) = app.post("/api/tasks/claim", claim.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], json!(id));
    assert_eq!(body["data"]["status"], "assigned");
    assert_eq!(body["data"]["assignee"], "w1");

    let (_, body) = app.post("/api/tasks/claim", claim).await;
    assert!(body["data"].is_null());

    let uri = format!("/api/tasks/{id}/status");
    let (status, body) = app.put(&uri, json!({ "status": "running" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["changed"], true);

    let done = json!({ "status": "completed", "result": { "artifact": "app.tar" } });
    let (_, body) = app.put(&uri, done.clone()).await;
    assert_eq!(body["data"]["changed"], true);
    let (status, body) = app.put(&uri, done).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["changed"], false);

    let (status, body) = app.put(&uri, json!({ "status": "running" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "INVALID_TRANSITION");

    let (_, body) = app.get(&format!("/api/tasks/{id}")).await;
    assert_eq!(body["data"]["result"]["artifact"], "app.tar");
}

#[tokio::test]
async fn test_plan_creation_and_validation() {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .post(
            "/api/plans",
            json!({ "tasks": [
                { "id": "a", "task_type": "step", "depends_on": ["b"] },
                { "id": "b", "task_type": "step", "depends_on": ["a"] }
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "CYCLIC_DEPENDENCY");

    let (status, body) = app
        .post(
            "/api/plans",
            json!({ "tasks": [
                { "id": "a", "task_type": "step", "depends_on": ["missing"] }
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "UNKNOWN_DEPENDENCY");
    assert_eq!(app.core.get_stats().await.unwrap().queued, 0);

    let (status, body) = app
        .post(
            "/api/plans",
            json!({ "tasks": [
                { "id": "fetch", "task_type": "io" },
                { "id": "build", "task_type": "cpu", "depends_on": ["fetch"] }
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let plan_id = body["data"]["plan_id"].as_str().unwrap().to_string();

    let (status, body) = app.get(&format!("/api/plans/{plan_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");
    assert_eq!(body["data"]["tasks"].as_array().unwrap().len(), 2);

    let (status, _) = app.get("/api/plans/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_queued_and_running_tasks() {
    let app = TestApp::spawn().await;
    let queued = app.create_task("job").await;
    let (status, body) = app
        .post(&format!("/api/tasks/{queued}/cancel"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "cancelled");
    assert_eq!(body["data"]["task"]["status"], "cancelled");

    let running = app.create_task("job").await;
    app.post("/api/tasks/claim", json!({ "worker_id": "w1", "capabilities": ["*"] }))
        .await;
    app.put(&format!("/api/tasks/{running}/status"), json!({ "status": "running" }))
        .await;
    let (status, body) = app
        .post(&format!("/api/tasks/{running}/cancel"), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["outcome"], "cancel_requested");
    assert_eq!(body["data"]["task"]["cancel_requested"], true);
}

#[tokio::test]
async fn test_release_returns_unstarted_task_to_queue() {
    let app = TestApp::spawn().await;
    let id = app.create_task("job").await;
    app.post("/api/tasks/claim", json!({ "worker_id": "w1", "capabilities": ["*"] }))
        .await;

    let (status, body) = app
        .post(&format!("/api/tasks/{id}/release"), json!({ "worker_id": "w2" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["released"], false);

    let (status, body) = app
        .post(&format!("/api/tasks/{id}/release"), json!({ "worker_id": "w1" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["released"], true);

    let (_, body) = app.get(&format!("/api/tasks/{id}")).await;
    assert_eq!(body["data"]["status"], "queued");
    assert!(body["data"]["assignee"].is_null());
}

#[tokio::test]
async fn test_worker_heartbeat_and_listing() {
    let app = TestApp::spawn().await;
    app.post("/api/workers", json!({ "worker_id": "w1", "capabilities": ["review"] }))
        .await;
    app.post("/api/workers", json!({ "worker_id": "w2", "capabilities": ["deploy"] }))
        .await;

    let (status, body) = app
        .post("/api/workers/w1/heartbeat", json!({ "status": "active" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");

    let (status, body) = app.post("/api/workers/ghost/heartbeat", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "WORKER_NOT_FOUND");

    let (_, body) = app.get("/api/workers?capability=deploy").await;
    let workers = body["data"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["id"], "w2");

    let (_, body) = app.get("/api/workers").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_event_replay_and_dead_letters() {
    let app = TestApp::spawn().await;
    let id = app.create_task("job").await;

    let (status, body) = app.get("/api/events/replay?pattern=task.*&limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let events = body["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["topic"], "task.created");
    assert_eq!(events[0]["payload"]["task_id"], json!(id));

    let (status, _) = app.get("/api/events/replay?since=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.get("/api/events/dead-letters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_system_stats_and_reload() {
    let app = TestApp::spawn().await;
    app.create_task("job").await;

    let (status, body) = app.get("/api/system/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queued"], 1);
    assert_eq!(body["data"]["breaker_state"], "closed");
    assert_eq!(body["data"]["dead_letters"], 0);

    let (status, body) = app.post("/api/system/reload", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["changed"], false);
    assert_eq!(body["data"]["restart_required"], json!([]));
}
