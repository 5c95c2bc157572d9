//! Database connection management
//!
//! Provides connection pooling, migrations, health checks, and pool statistics.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::DatabaseConfig;

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection statistics
#[derive(Debug, Clone)]
pub struct PoolStatistics {
    /// Number of currently idle connections
    pub idle_connections: u32,

    /// Number of connections checked out
    pub active_connections: u32,

    /// Connections currently open
    pub open_connections: u32,

    /// Timestamp of the statistics collection (Unix timestamp in seconds)
    pub collected_at: u64,
}

/// Database connection wrapper
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Arc<DatabasePool>,
}

impl DatabaseConnection {
    /// Connect using a SQLite URL such as `sqlite:orchestrator.db`
    ///
    /// The database file is created if it does not exist.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_max_connections(database_url, 5).await
    }

    /// Connect with a custom pool size
    pub async fn with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Connect from the `[database]` configuration section
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        Self::with_max_connections(&config.url, config.max_connections).await
    }

    /// Private in-memory database with migrations applied
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let conn = Self {
            pool: Arc::new(pool),
        };
        conn.run_migrations().await?;
        Ok(conn)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Run migrations on the database
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;

        Ok(())
    }

    /// Get connection pool statistics
    pub fn get_pool_statistics(&self) -> PoolStatistics {
        let pool_ref = self.pool.as_ref();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let idle = pool_ref.num_idle() as u32;
        let open = pool_ref.size();

        PoolStatistics {
            idle_connections: idle,
            active_connections: open.saturating_sub(idle),
            open_connections: open,
            collected_at: now,
        }
    }

    /// Close the connection pool gracefully
    pub async fn close(self) {
        self.pool.close().await;
    }
}
