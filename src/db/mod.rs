//! Postgres access: the pgmq queue adapter and the correlation store
//! share one pool.

pub mod correlation;
pub mod pgmq;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::PgmqConfig;
use crate::error::{Error, Result};

pub use correlation::PgCorrelationStore;

/// pgmq-backed queue backend and admin.
pub struct Db {
    pool: PgPool,
    config: PgmqConfig,
}

impl Db {
    /// Validate `config` and open the pool.
    pub async fn connect(config: PgmqConfig) -> Result<Self> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(config.dsn.expose_secret())
            .await?;
        Ok(Self { pool, config })
    }

    /// Install the pgmq extension and the correlation table.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Correlation store over the same pool.
    pub fn correlation_store(&self) -> PgCorrelationStore {
        PgCorrelationStore::new(self.pool.clone())
    }

    pub fn config(&self) -> &PgmqConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
