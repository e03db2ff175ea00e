use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use orchestrator_core::Task;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("任务参数无效: {0}")]
    InvalidPayload(String),

    #[error("任务执行失败: {0}")]
    Failed(String),

    #[error("任务已取消")]
    Cancelled,
}

pub type ExecutionResult = Result<Value, ExecutionError>;

/// 单次执行的上下文
///
/// 取消标记由运行时在发现 `cancel_requested` 后置位，执行器在检查点观察它。
#[derive(Clone)]
pub struct ExecutionContext {
    pub worker_id: String,
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn new(worker_id: impl Into<String>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            worker_id: worker_id.into(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// 等到取消标记置位；发送端被丢弃时永远挂起
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let closed = rx.wait_for(|flag| *flag).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ExecutionResult;
}

/// 按任务类型查找执行器，`*` 作为兜底
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&mut self, task_type: S, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type.into(), executor);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors
            .get(task_type)
            .or_else(|| self.executors.get("*"))
            .cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Shell 任务参数，对应任务 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// 以子进程执行 payload 中的命令，取消时终止子进程
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> ExecutionResult {
        let params: ShellTaskParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| ExecutionError::InvalidPayload(format!("解析Shell任务参数失败: {e}")))?;
        let start_time = Instant::now();

        info!(
            "执行Shell任务: task_id={}, command={}, args={:?}",
            task.id, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::Failed(format!("启动Shell命令失败: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Failed("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Failed("无法获取stderr".to_string()))?;

        let collect = async {
            let mut stdout_lines = Vec::new();
            let mut stderr_lines = Vec::new();
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let read_out = async {
                while let Ok(Some(line)) = out.next_line().await {
                    stdout_lines.push(line);
                }
            };
            let read_err = async {
                while let Ok(Some(line)) = err.next_line().await {
                    stderr_lines.push(line);
                }
            };
            tokio::join!(read_out, read_err);
            let status = child.wait().await;
            (status, stdout_lines, stderr_lines)
        };

        let (status, stdout_lines, stderr_lines) = tokio::select! {
            outcome = collect => outcome,
            _ = ctx.cancelled() => {
                warn!("Shell任务被取消，终止子进程: task_id={}", task.id);
                return Err(ExecutionError::Cancelled);
            }
        };

        let status =
            status.map_err(|e| ExecutionError::Failed(format!("等待进程结束失败: {e}")))?;
        let duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "Shell任务执行完成: task_id={}, success={}, exit_code={:?}, duration={}ms",
            task.id,
            status.success(),
            status.code(),
            duration_ms
        );

        if status.success() {
            Ok(json!({
                "exit_code": status.code(),
                "stdout": stdout_lines.join("\n"),
                "duration_ms": duration_ms,
            }))
        } else if stderr_lines.is_empty() {
            Err(ExecutionError::Failed(format!(
                "命令执行失败，退出码: {:?}",
                status.code()
            )))
        } else {
            Err(ExecutionError::Failed(stderr_lines.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestrator_core::TaskStatus;

    fn shell_task(payload: Value) -> Task {
        Task {
            id: "t1".into(),
            task_type: "shell".into(),
            payload,
            priority: 0,
            status: TaskStatus::Running,
            assignee: Some("w1".into()),
            parent_plan_id: None,
            depends_on: vec![],
            retry_count: 0,
            max_retries: 0,
            cancel_requested: false,
            result: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> ExecutionResult {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_registry_falls_back_to_wildcard() {
        let mut registry = ExecutorRegistry::new();
        registry.register("shell", Arc::new(ShellExecutor::new()));
        assert!(registry.get("review").is_none());

        registry.register("*", Arc::new(Noop));
        assert_eq!(registry.get("shell").map(|e| e.name().to_string()).as_deref(), Some("shell"));
        assert_eq!(registry.get("review").map(|e| e.name().to_string()).as_deref(), Some("noop"));
        assert_eq!(registry.task_types(), vec!["*".to_string(), "shell".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_captures_output() {
        let (_tx, rx) = watch::channel(false);
        let ctx = ExecutionContext::new("w1", rx);
        let task = shell_task(json!({ "command": "echo", "args": ["hello"] }));

        let output = ShellExecutor::new().execute(&task, &ctx).await.unwrap();
        assert_eq!(output["stdout"], json!("hello"));
        assert_eq!(output["exit_code"], json!(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_reports_non_zero_exit() {
        let (_tx, rx) = watch::channel(false);
        let ctx = ExecutionContext::new("w1", rx);
        let task = shell_task(json!({ "command": "false" }));

        let err = ShellExecutor::new().execute(&task, &ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_stops_on_cancel() {
        let (tx, rx) = watch::channel(false);
        let ctx = ExecutionContext::new("w1", rx);
        let task = shell_task(json!({ "command": "sleep", "args": ["30"] }));

        let started = Instant::now();
        let run = tokio::spawn(async move { ShellExecutor::new().execute(&task, &ctx).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let (_tx, rx) = watch::channel(false);
        let ctx = ExecutionContext::new("w1", rx);
        let err = ShellExecutor::new()
            .execute(&shell_task(json!({ "args": [] })), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }
}
