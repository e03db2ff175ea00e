pub mod manager;
pub mod mapping;
pub mod sqlite;
pub mod statements;

pub use manager::{DatabaseManager, PoolStats, SqlValue, Statement};
pub use sqlite::{SqliteEventStore, SqliteTaskRepository, SqliteWorkerRepository};
