//! 配置管理
//!
//! - `models`：各配置段及其校验
//! - `hot_reload`：`ConfigHandle`，运行时重新加载并广播新配置

pub mod hot_reload;
pub mod models;

pub use hot_reload::{ConfigHandle, ReloadOutcome};
pub use models::*;
