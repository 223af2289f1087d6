//! Counter aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::signal::wait_or_cancel;
use crate::storage::Storage;

/// High enough to drain a backlog efficiently, low enough to keep the row
/// locks taken by one page from stalling other writers.
const RECORDS_PER_PASS: usize = 1000;

const DELAY_BETWEEN_PASSES: Duration = Duration::from_millis(500);

/// Periodically collapses raw counter delta rows into one running total per
/// key, bounding `counter` table growth.
///
/// Only rows without an explicit expiration are aggregated: the merged total
/// carries no expiry of its own, so expiring deltas are left for the
/// expiration manager to discard instead.
pub struct CountersAggregator {
    storage: Arc<Storage>,
    interval: Duration,
    delete_page_sql: String,
    upsert_sql: String,
}

impl CountersAggregator {
    pub fn new(storage: Arc<Storage>, interval: Duration) -> Self {
        let counter = storage.table("counter");
        let aggregated = storage.table("aggregatedcounter");

        let delete_page_sql = format!(
            "DELETE FROM {counter} WHERE \"id\" IN (\
               SELECT \"id\" FROM {counter} WHERE \"expireat\" IS NULL LIMIT $1\
             ) RETURNING \"key\", \"value\""
        );
        // GREATEST skips NULLs, so a delta without expiry keeps the
        // aggregated row's existing expiration.
        let upsert_sql = format!(
            "INSERT INTO {aggregated} (\"key\", \"value\", \"expireat\") VALUES ($1, $2, NULL) \
             ON CONFLICT (\"key\") DO UPDATE SET \
               \"value\" = {aggregated_bare}.\"value\" + EXCLUDED.\"value\", \
               \"expireat\" = GREATEST({aggregated_bare}.\"expireat\", EXCLUDED.\"expireat\")",
            aggregated_bare = "\"aggregatedcounter\"",
        );

        Self {
            storage,
            interval,
            delete_page_sql,
            upsert_sql,
        }
    }

    /// Run forever: drain the backlog, then sleep until the next scheduled
    /// pass. Returns [`Error::Cancelled`](crate::Error::Cancelled) on
    /// shutdown.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        loop {
            self.execute(token).await?;
            wait_or_cancel(self.interval, token).await?;
        }
    }

    /// One full aggregation pass. Pages of exactly [`RECORDS_PER_PASS`] rows
    /// mean more backlog may remain, so the loop continues after a short
    /// pause; a short page ends the pass.
    pub async fn execute(&self, token: &CancellationToken) -> Result<()> {
        debug!("aggregating records in the counter table");

        loop {
            let removed = self.aggregate_page().await?;
            if removed < RECORDS_PER_PASS {
                break;
            }
            wait_or_cancel(DELAY_BETWEEN_PASSES, token).await?;
        }

        trace!("counter table aggregated");
        Ok(())
    }

    /// Delete one page of non-expiring delta rows and fold their sums into
    /// the aggregated table, all inside a single transaction: either the
    /// deltas are merged and gone, or neither. Returns the page size.
    async fn aggregate_page(&self) -> Result<usize> {
        let mut tx = self.storage.begin().await?;

        let deltas: Vec<(String, i64)> = sqlx::query_as(&self.delete_page_sql)
            .bind(RECORDS_PER_PASS as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut totals: HashMap<&str, i64> = HashMap::new();
        for (key, value) in &deltas {
            *totals.entry(key.as_str()).or_default() += value;
        }

        for (key, total) in totals {
            sqlx::query(&self.upsert_sql)
                .bind(key)
                .bind(total)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !deltas.is_empty() {
            debug!(rows = deltas.len(), "aggregated counter delta rows");
        }
        Ok(deltas.len())
    }
}
