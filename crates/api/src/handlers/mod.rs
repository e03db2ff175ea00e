pub mod events;
pub mod health;
pub mod plans;
pub mod system;
pub mod tasks;
pub mod workers;
