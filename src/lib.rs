//! 编排核心进程入口：运行模式与优雅关闭

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::ShutdownManager;
