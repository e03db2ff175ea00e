use std::time::Duration;

use thiserror::Error;

/// 编排核心错误类型定义
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// 超时、连接重置、数据库忙等可重试的瞬时错误
    #[error("瞬时错误: {0}")]
    Transient(String),

    /// 约束冲突（重复ID等），不可重试
    #[error("冲突: {0}")]
    Conflict(String),

    #[error("非法的状态转换: 任务 {task_id} 从 {from} 到 {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("检测到循环依赖: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("未知的依赖: 任务 {task_id} 依赖 {dependency_id}")]
    UnknownDependency {
        task_id: String,
        dependency_id: String,
    },

    #[error("熔断器已打开，{retry_after:?} 后重试")]
    CircuitOpen { retry_after: Duration },

    #[error("主题队列已满: {topic}")]
    QueueFull { topic: String },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("执行计划未找到: {id}")]
    PlanNotFound { id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }

    /// 是否计入熔断器失败计数
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// 调用方是否可以（退避后）重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::Timeout(_)
                | Self::Conflict(_)
                | Self::CircuitOpen { .. }
                | Self::QueueFull { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. } | Self::PlanNotFound { .. } | Self::WorkerNotFound { .. }
        )
    }
}

// SQLite 的 BUSY(5) / LOCKED(6) 主结果码，扩展码的低8位与之相同
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::Transient("获取数据库连接超时".to_string()),
            sqlx::Error::PoolClosed => Self::Transient("数据库连接池已关闭".to_string()),
            sqlx::Error::Io(e) => Self::Transient(format!("数据库IO错误: {e}")),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return Self::Conflict(db_err.message().to_string());
                }
                let primary = db_err
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| c & 0xff);
                match primary {
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                        Self::Transient(format!("数据库繁忙: {}", db_err.message()))
                    }
                    _ => Self::Database(err.to_string()),
                }
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for OrchestratorError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("数据库迁移失败: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(OrchestratorError::transient("reset").is_transient());
        assert!(OrchestratorError::Timeout("acquire".into()).is_transient());
        assert!(!OrchestratorError::conflict("dup").is_transient());
        assert!(OrchestratorError::conflict("dup").is_retryable());
        assert!(!OrchestratorError::InvalidTransition {
            task_id: "t".into(),
            from: "completed".into(),
            to: "running".into(),
        }
        .is_retryable());
        assert!(OrchestratorError::task_not_found("x").is_not_found());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: OrchestratorError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = OrchestratorError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "检测到循环依赖: a -> b -> a");
    }
}
