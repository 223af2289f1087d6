//! In-process wake-up primitives.
//!
//! The signal registry is the lowest-level building block of the queue: a
//! concurrent map from queue name to a reusable single-slot notification
//! primitive. Dequeue loops park on these instead of busy-polling; the
//! write-only transaction fires them after a commit lands jobs in a queue.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Registry of per-key notification slots.
///
/// Slots are created lazily on first wait, so the map stays bounded by the
/// number of queue names actually in use. [`Notify`] stores a single permit
/// when notified without a waiter, so a wake-up that races ahead of the wait
/// is not lost.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    slots: DashMap<String, Arc<Notify>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or lazily create) the notification slot for `key`. The returned
    /// handle stays valid for the life of the registry.
    pub fn listen(&self, key: &str) -> Arc<Notify> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake one waiter on `key`, if anyone has ever listened on it. A key
    /// nobody waits on allocates nothing.
    pub fn notify(&self, key: &str) {
        if let Some(slot) = self.slots.get(key) {
            slot.notify_one();
        }
    }
}

/// Sleep for up to `duration`, returning [`Error::Cancelled`] as soon as the
/// token fires. Every bounded pause in the background workers goes through
/// here so shutdown is never delayed by a sleep.
pub async fn wait_or_cancel(duration: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
