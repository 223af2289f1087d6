//! Transactional job queue.
//!
//! Producers insert queue entries inside their own transactions; consumers
//! claim entries through one of two interchangeable strategies (see
//! [`strategy`]) and receive a [`FetchedJob`] handle that guarantees the
//! entry is either removed or re-offered. The dequeue loop blends bounded
//! polling with in-process signals and the optional database notification
//! channel, so idle workers wake promptly without busy-polling.

mod fetched;
mod listener;
mod strategy;

pub use fetched::FetchedJob;

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::Storage;

use strategy::{ClaimStrategy, LockingClaim, VersionedClaim};

/// Durable FIFO-per-queue job queue over the `jobqueue` table.
pub struct JobQueue {
    storage: Arc<Storage>,
    strategy: Box<dyn ClaimStrategy>,
    /// "Check now" signal: same-process producers fire this so blocked
    /// dequeue loops re-evaluate without waiting out a poll interval.
    check_now: Notify,
    /// Fired by the notification-channel listener.
    notification: Arc<Notify>,
}

impl JobQueue {
    /// Build a queue over `storage`, selecting the claim strategy from
    /// `use_native_transactions`.
    pub fn new(storage: Arc<Storage>) -> Self {
        let strategy: Box<dyn ClaimStrategy> = if storage.config().use_native_transactions {
            Box::new(LockingClaim::new(&storage))
        } else {
            Box::new(VersionedClaim::new(&storage))
        };

        Self {
            storage,
            strategy,
            check_now: Notify::new(),
            notification: Arc::new(Notify::new()),
        }
    }

    /// Insert one queue entry with a null fetched-at marker.
    ///
    /// Runs on the caller's connection or transaction and never commits on
    /// its own; the caller signals the queue after its commit succeeds
    /// (the write-only transaction does this automatically).
    pub async fn enqueue<'e, E>(&self, executor: E, queue: &str, job_id: Uuid) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(&enqueue_sql(&self.storage))
            .bind(job_id)
            .bind(queue)
            .execute(executor)
            .await?;

        debug!(queue, %job_id, "job enqueued");
        Ok(())
    }

    /// Block until a job is available on any of `queues`, or `token` fires.
    ///
    /// Returns [`Error::InvalidArgument`] for an empty queue list and
    /// [`Error::Cancelled`] on cancellation; it never reports "no job" to a
    /// caller that is still waiting. A pre-cancelled token fails before any
    /// database round trip.
    pub async fn dequeue(
        &self,
        queues: &[&str],
        token: &CancellationToken,
    ) -> Result<FetchedJob> {
        if queues.is_empty() {
            return Err(Error::invalid_argument("queue list must be non-empty"));
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let queues: Vec<String> = queues.iter().map(|q| q.to_string()).collect();
        let queue_signals: Vec<Arc<Notify>> = queues
            .iter()
            .map(|q| self.storage.signals().listen(q))
            .collect();

        loop {
            if let Some(entry) = self.strategy.claim(&self.storage, &queues).await? {
                debug!(queue = %entry.queue, job_id = %entry.job_id, "job fetched");
                return Ok(FetchedJob::new(
                    self.storage.clone(),
                    entry.id,
                    entry.job_id,
                    entry.queue,
                ));
            }

            self.wait_for_work(&queue_signals, token).await?;
        }
    }

    /// Wake any blocked dequeue loop so it re-checks the queue table
    /// immediately.
    pub fn fetch_next_job(&self) {
        self.check_now.notify_one();
    }

    /// Subscribe a dedicated connection to the database's change-notification
    /// channel and forward notifications into the dequeue wait. Returns
    /// `None` when long polling is disabled; if the backend turns out not to
    /// support notifications the task logs once and polling alone carries on.
    pub fn listen_for_notifications(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.storage.config().enable_long_polling {
            return None;
        }
        Some(listener::spawn(
            self.storage.clone(),
            self.notification.clone(),
            token,
        ))
    }

    /// Park until something suggests a claim attempt is worth repeating:
    /// cancellation, the explicit check-now signal, a channel notification,
    /// one of the requested queues being signaled, or the poll interval
    /// lapsing (covers missed signals).
    async fn wait_for_work(
        &self,
        queue_signals: &[Arc<Notify>],
        token: &CancellationToken,
    ) -> Result<()> {
        let any_queue =
            futures::future::select_all(queue_signals.iter().map(|n| Box::pin(n.notified())));

        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = self.check_now.notified() => Ok(()),
            _ = self.notification.notified() => Ok(()),
            _ = any_queue => Ok(()),
            _ = tokio::time::sleep(self.storage.config().queue_poll_interval) => Ok(()),
        }
    }
}

/// INSERT statement shared by [`JobQueue::enqueue`] and the write-only
/// transaction's `add_to_queue`.
pub(crate) fn enqueue_sql(storage: &Storage) -> String {
    format!(
        "INSERT INTO {} (\"jobid\", \"queue\") VALUES ($1, $2)",
        storage.table("jobqueue")
    )
}
