//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::ledger::PgLedger;
use crate::ledger::schema::ensure_schema;

/// Watchers, reorg guard, sweeper and payouts share one pool
const MAX_CONNECTIONS: u32 = 20;

/// PostgreSQL connection pool for the custody ledger
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create missing custody tables, then hand out the ledger
    pub async fn bootstrap(&self) -> Result<PgLedger, sqlx::Error> {
        ensure_schema(&self.pool).await?;
        Ok(PgLedger::new(self.pool.clone()))
    }
}
