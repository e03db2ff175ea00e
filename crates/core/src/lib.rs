//! 编排核心的共享基础：错误分类、熔断器、配置、日志、领域模型与仓储接口。

pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use config::{
    ApiConfig, AppConfig, ConfigHandle, DatabaseConfig, EngineConfig, EventBusConfig,
    ObservabilityConfig, RegistryConfig, ReloadOutcome, ResilienceConfig, WorkerRuntimeConfig,
};
pub use errors::{OrchestratorError, OrchestratorResult};
pub use logging::init_logging;
pub use models::*;
pub use traits::*;
