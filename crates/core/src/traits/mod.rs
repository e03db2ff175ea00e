pub mod event;
pub mod repository;

pub use event::*;
pub use repository::*;
