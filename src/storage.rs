//! Connection and transaction provider.
//!
//! [`Storage`] owns the connection pool, the validated configuration and the
//! process-wide signal registry. Every component of the crate borrows it
//! through an `Arc`; none of them open connections on their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::trace;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::signal::SignalRegistry;

/// Shared handle to the PostgreSQL backend.
#[derive(Debug)]
pub struct Storage {
    pool: PgPool,
    config: StorageConfig,
    signals: SignalRegistry,
}

impl Storage {
    /// Open a new connection pool against `database_url`.
    pub async fn connect(database_url: &str, config: StorageConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Arc::new(Self {
            pool,
            config,
            signals: SignalRegistry::new(),
        }))
    }

    /// Wrap an externally managed pool, for composition with a caller that
    /// already owns the connections.
    pub fn with_pool(pool: PgPool, config: StorageConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            pool,
            config,
            signals: SignalRegistry::new(),
        }))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The validated configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The process-wide queue signal registry.
    pub fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    /// Schema-qualified, quoted table identifier.
    pub fn table(&self, name: &str) -> String {
        format!("\"{}\".\"{}\"", self.config.schema_name, name)
    }

    /// Begin a transaction. PostgreSQL's default read-committed isolation is
    /// what both dequeue strategies and the maintenance sweeps expect.
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

/// Re-run `op` for as long as it fails with a transaction serialization
/// conflict. Conflicts of this class are a normal consequence of concurrent
/// dequeue and are invisible to the caller; any other error propagates.
pub async fn retry_serialization<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Err(err) if err.is_serialization_failure() => {
                trace!("retrying after transaction serialization conflict");
            }
            result => return result,
        }
    }
}
