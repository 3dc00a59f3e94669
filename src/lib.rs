pub mod audit;
pub mod config;
pub mod database;
pub mod error;

pub use config::AppConfig;
pub use database::Database;
pub use error::{AuditError, AuditResult};
