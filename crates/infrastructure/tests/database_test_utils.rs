#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use orchestrator_core::config::models::DatabaseConfig;
use orchestrator_core::{CircuitBreaker, ExecutionPlan, Task, TaskStatus};
use orchestrator_infrastructure::DatabaseManager;
use tempfile::TempDir;

/// 基于临时文件的测试数据库，目录随结构体一起删除
pub struct TestDatabase {
    _dir: TempDir,
    pub db: Arc<DatabaseManager>,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("orchestrator.db").display()),
            max_connections: 8,
            ..Default::default()
        };
        let db = DatabaseManager::connect(&config, CircuitBreaker::new()).await?;
        Ok(Self {
            _dir: dir,
            db: Arc::new(db),
        })
    }
}

pub fn task(id: &str, task_type: &str, priority: i64) -> Task {
    let now = Utc::now();
    Task {
        id: id.to_string(),
        task_type: task_type.to_string(),
        payload: serde_json::json!({ "id": id }),
        priority,
        status: TaskStatus::Queued,
        assignee: None,
        parent_plan_id: None,
        depends_on: Vec::new(),
        retry_count: 0,
        max_retries: 3,
        cancel_requested: false,
        result: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn plan(id: &str) -> ExecutionPlan {
    ExecutionPlan {
        id: id.to_string(),
        parent_task_id: None,
        correlation_id: id.to_string(),
        created_at: Utc::now(),
        finished_at: None,
    }
}

pub fn plan_task(plan_id: &str, id: &str, task_type: &str) -> Task {
    Task {
        parent_plan_id: Some(plan_id.to_string()),
        ..task(id, task_type, 0)
    }
}

pub fn any_capability() -> Vec<String> {
    vec!["*".to_string()]
}
