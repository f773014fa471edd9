pub mod api_observability;
pub mod app_config;
pub mod connection;
pub mod database;
pub mod scheduler;
pub mod tasks;

pub use api_observability::*;
pub use app_config::*;
pub use connection::*;
pub use database::*;
pub use scheduler::*;
pub use tasks::*;
