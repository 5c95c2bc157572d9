//! Durable store
//!
//! SQLite connectivity, row models, repositories and error handling for
//! tasks, checkpoints, automations and learned checkpoint preferences.

pub mod connection;
pub mod error;
pub mod models;
pub mod repositories;

pub use connection::{DatabaseConnection, DatabasePool, PoolStatistics};
pub use error::{DatabaseError, DbResult};
