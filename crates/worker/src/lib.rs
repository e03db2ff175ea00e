//! 编排核心的 Worker 端
//!
//! Worker 注册自身能力、维持心跳、认领任务并回报执行结果。
//! 同进程部署时使用 `LocalCoreClient`，独立部署时使用 `HttpCoreClient`。

pub mod client;
pub mod executor;
pub mod runtime;

pub use client::{CoreClient, HttpCoreClient, LocalCoreClient};
pub use executor::{
    ExecutionContext, ExecutionError, ExecutionResult, ExecutorRegistry, ShellExecutor,
    ShellTaskParams, TaskExecutor,
};
pub use runtime::{default_worker_id, WorkerRuntime};
