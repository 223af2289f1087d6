//! Record expiration sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock::DistributedLock;
use crate::signal::wait_or_cancel;
use crate::storage::Storage;

const LOCK_RESOURCE: &str = "locks:expirationmanager";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DELAY_BETWEEN_BATCHES: Duration = Duration::from_secs(1);

/// Swept in this fixed order, one maintenance-lock hold per table.
const PROCESSED_TABLES: [&str; 6] = [
    "aggregatedcounter",
    "counter",
    "job",
    "list",
    "set",
    "hash",
];

/// Completed-job bookkeeping counters merged at the end of every pass.
const PROCESSED_COUNTERS: [&str; 2] = ["stats:succeeded", "stats:deleted"];

/// Deletes rows whose expiration has passed, across every persisted record
/// table, in bounded batches.
///
/// Exactly one server instance performs each sweep: the distributed
/// maintenance lock serializes the fleet, and failing to win it is a normal
/// outcome, not an error — the losing instance simply skips that table until
/// its next pass.
pub struct ExpirationManager {
    storage: Arc<Storage>,
    lock: Arc<dyn DistributedLock>,
    check_interval: Duration,
}

impl ExpirationManager {
    pub fn new(
        storage: Arc<Storage>,
        lock: Arc<dyn DistributedLock>,
        check_interval: Duration,
    ) -> Self {
        Self {
            storage,
            lock,
            check_interval,
        }
    }

    /// Run forever, one full pass per `check_interval`. Returns
    /// [`Error::Cancelled`] on shutdown; any non-lock-timeout error aborts
    /// the current pass and propagates.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        loop {
            self.execute(token).await?;
            wait_or_cancel(self.check_interval, token).await?;
        }
    }

    /// One full pass: sweep every table, then merge the well-known counters.
    pub async fn execute(&self, token: &CancellationToken) -> Result<()> {
        for table in PROCESSED_TABLES {
            debug!(table, "removing outdated records");
            self.with_maintenance_lock(self.sweep_table(table, token))
                .await?;
        }

        for counter in PROCESSED_COUNTERS {
            self.with_maintenance_lock(self.aggregate_counter(counter))
                .await?;
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        Ok(())
    }

    /// Run `work` while holding the cluster-wide maintenance lock. A lock
    /// timeout means another server is already doing this work; the cycle is
    /// skipped and will be retried on the next pass.
    async fn with_maintenance_lock<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match self.lock.acquire(LOCK_RESOURCE, LOCK_TIMEOUT).await {
            Ok(()) => {}
            Err(Error::LockTimeout { resource, timeout }) if resource == LOCK_RESOURCE => {
                debug!(
                    resource,
                    ?timeout,
                    "maintenance lock held by another server; outdated records \
                     were not removed here and will be retried next pass"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let result = work.await;
        let released = self.lock.release(LOCK_RESOURCE).await;
        result.and(released)
    }

    /// Delete expired rows from `table` in batches until a batch comes back
    /// empty, pausing between non-empty batches to bound lock contention.
    async fn sweep_table(&self, table: &str, token: &CancellationToken) -> Result<()> {
        let qualified = self.storage.table(table);
        let sql = format!(
            "DELETE FROM {qualified} WHERE \"id\" IN (\
               SELECT \"id\" FROM {qualified} WHERE \"expireat\" < now() LIMIT $1\
             )"
        );
        let batch_size = self.storage.config().delete_expired_batch_size;

        loop {
            let removed = sqlx::query(&sql)
                .bind(batch_size)
                .execute(self.storage.pool())
                .await?
                .rows_affected();

            if removed == 0 {
                return Ok(());
            }

            info!(table, removed, "removed outdated records");
            wait_or_cancel(DELAY_BETWEEN_BATCHES, token).await?;
        }
    }

    /// Collapse one well-known counter's non-expiring delta rows into a
    /// single merged delta row, leaving per-key totals intact for the
    /// aggregator proper.
    async fn aggregate_counter(&self, key: &str) -> Result<()> {
        let counter = self.storage.table("counter");

        let drain_sql = format!(
            "WITH \"deltas\" AS (\
               DELETE FROM {counter} WHERE \"key\" = $1 AND \"expireat\" IS NULL \
               RETURNING \"value\"\
             ) SELECT COALESCE(SUM(\"value\"), 0)::bigint FROM \"deltas\""
        );

        // Drain and re-insert under one transaction so no delta is ever
        // deleted without its value surviving in the merged row.
        let mut tx = self.storage.begin().await?;
        let sum: i64 = sqlx::query_scalar(&drain_sql)
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

        if sum != 0 {
            let insert_sql =
                format!("INSERT INTO {counter} (\"key\", \"value\") VALUES ($1, $2)");
            sqlx::query(&insert_sql)
                .bind(key)
                .bind(sum)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if sum != 0 {
            debug!(key, sum, "merged counter delta rows");
        }

        Ok(())
    }
}
