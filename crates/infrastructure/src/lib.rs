//! 编排核心的基础设施：SQLite 持久化层与进程内事件总线

pub mod database;
pub mod event_bus;

pub use database::{
    DatabaseManager, PoolStats, SqlValue, SqliteEventStore, SqliteTaskRepository,
    SqliteWorkerRepository, Statement,
};
pub use event_bus::{
    handler_fn, Backpressure, DeadLetter, EventBus, EventBusStats, EventHandler, EventWaiter,
    RetryPolicy, SubscriptionId,
};
