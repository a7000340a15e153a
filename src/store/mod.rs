//! Order store: PostgreSQL as the concurrency primitive.
//!
//! All cross-task coordination goes through atomic SQL (CAS updates
//! keyed on expected status, claim-batches via `FOR UPDATE SKIP LOCKED`,
//! unique-index dedupe on trades), which makes N-process replication
//! correct by construction.

pub mod accounts;
pub mod cancel_queue;
pub mod failed_orders;
pub mod models;
pub mod orders;
pub mod positions;
pub mod schema;
pub mod webhook_log;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::RouterError;

/// PostgreSQL connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new connection pool and bootstrap the schema.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, RouterError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| RouterError::Database(e.to_string()))?;

        tracing::info!("PostgreSQL connection pool established");
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), RouterError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
