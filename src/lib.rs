//! # granary
//!
//! Durable queue and maintenance layer for a background-job processing
//! framework, with a single PostgreSQL (or Postgres-wire-compatible)
//! database as the only source of truth, no separate broker.
//!
//! ## Architecture
//!
//! - **Signal Registry**: per-queue in-process wake-up primitives
//! - **Job Queue**: transactional enqueue/dequeue with two interchangeable
//!   claim strategies (pessimistic row locks vs. optimistic version CAS) and
//!   a wait loop that blends polling with signals
//! - **Write-Only Transaction**: batches mutations into one atomic commit
//!   and wakes workers only after durability is certain
//! - **Counters Aggregator**: folds counter delta rows into running totals
//! - **Expiration Manager**: sweeps expired rows, exclusively across the
//!   fleet via a distributed maintenance lock
//!
//! ## Usage
//!
//! ```rust,ignore
//! use granary::{JobQueue, Storage, StorageConfig, WriteOnlyTransaction};
//! use tokio_util::sync::CancellationToken;
//!
//! let storage = Storage::connect("postgres://...", StorageConfig::default()).await?;
//! let queue = JobQueue::new(storage.clone());
//!
//! // Producer: enqueue atomically with other writes, then signal workers.
//! let mut batch = WriteOnlyTransaction::new(storage.clone());
//! batch.add_to_queue("default", job_id);
//! batch.increment_counter("stats:enqueued");
//! batch.commit().await?;
//!
//! // Consumer: blocks until a job arrives or shutdown is requested.
//! let token = CancellationToken::new();
//! let job = queue.dequeue(&["default"], &token).await?;
//! // ... process ...
//! job.remove_from_queue().await?;
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod maintenance;
pub mod queue;
pub mod signal;
pub mod storage;
pub mod transaction;

pub use config::StorageConfig;
pub use error::{Error, Result};
pub use lock::DistributedLock;
pub use maintenance::{CountersAggregator, ExpirationManager};
pub use queue::{FetchedJob, JobQueue};
pub use signal::SignalRegistry;
pub use storage::Storage;
pub use transaction::{CommitSignal, JobState, WriteOnlyTransaction};
