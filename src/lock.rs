//! Distributed mutual-exclusion seam.
//!
//! The maintenance workers must run exclusively across a multi-server
//! deployment. The locking algorithm itself lives outside this crate; the
//! workers consume it through this trait. Implementations are expected to
//! persist lock state so it survives process restarts and is visible to
//! every server.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Cluster-wide mutual-exclusion token.
///
/// `acquire` blocks up to `timeout` and then fails with
/// [`Error::LockTimeout`](crate::Error::LockTimeout) naming the resource.
/// Losing the race is a normal outcome for maintenance workers, not an
/// error condition.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Block until the lock on `resource` is held, or `timeout` elapses.
    async fn acquire(&self, resource: &str, timeout: Duration) -> Result<()>;

    /// Release a previously acquired lock on `resource`.
    async fn release(&self, resource: &str) -> Result<()>;
}
