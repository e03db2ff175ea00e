//! 编排核心的业务层
//!
//! - `engine`：任务与执行计划引擎
//! - `plan_validator`：计划依赖图校验
//! - `registry` / `reaper`：Worker注册中心与失效回收
//! - `assignment`：进程内Worker的推送式分配
//! - `orchestrator`：组装以上组件的对外入口

pub mod assignment;
pub mod engine;
pub mod orchestrator;
pub mod plan_validator;
pub mod reaper;
pub mod registry;

#[cfg(test)]
pub mod test_utils;

pub use assignment::AssignmentLoop;
pub use engine::{StatusChange, TaskEngine};
pub use orchestrator::{Orchestrator, SystemStats};
pub use plan_validator::{validate_plan, ValidatedPlan};
pub use reaper::Reaper;
pub use registry::{ReapReport, WorkerRegistry};
