//! Handle to a claimed queue entry.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::Storage;

/// A queue entry claimed by this process.
///
/// Exactly one of [`remove_from_queue`](Self::remove_from_queue) or
/// [`requeue`](Self::requeue) must be the final action. Dropping the handle
/// without either performs a best-effort requeue, so a consumer that crashes
/// or forgets cleanup never silently loses a job; even if the requeue itself
/// fails, the invisibility timeout re-offers the entry.
#[derive(Debug)]
pub struct FetchedJob {
    storage: Arc<Storage>,
    id: Uuid,
    job_id: Uuid,
    queue: String,
    settled: bool,
}

impl FetchedJob {
    pub(crate) fn new(storage: Arc<Storage>, id: Uuid, job_id: Uuid, queue: String) -> Self {
        Self {
            storage,
            id,
            job_id,
            queue,
            settled: false,
        }
    }

    /// Identifier of the job this entry refers to.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Name of the queue the entry was claimed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Delete the queue entry permanently. The job was handled.
    pub async fn remove_from_queue(mut self) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE \"id\" = $1",
            self.storage.table("jobqueue")
        );
        sqlx::query(&sql)
            .bind(self.id)
            .execute(self.storage.pool())
            .await?;

        self.settled = true;
        debug!(queue = %self.queue, job_id = %self.job_id, "job removed from queue");
        Ok(())
    }

    /// Clear fetched-at, making the entry immediately eligible again.
    pub async fn requeue(mut self) -> Result<()> {
        sqlx::query(&requeue_sql(&self.storage))
            .bind(self.id)
            .execute(self.storage.pool())
            .await?;

        self.settled = true;
        debug!(queue = %self.queue, job_id = %self.job_id, "job requeued");
        Ok(())
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        // Implicit requeue on every exit path that skipped a terminal call.
        let storage = self.storage.clone();
        let id = self.id;
        let job_id = self.job_id;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = sqlx::query(&requeue_sql(&storage))
                        .bind(id)
                        .execute(storage.pool())
                        .await
                    {
                        warn!(%job_id, %err, "implicit requeue failed; entry will be recovered by the invisibility timeout");
                    }
                });
            }
            Err(_) => {
                warn!(%job_id, "fetched job dropped outside a runtime; entry will be recovered by the invisibility timeout");
            }
        }
    }
}

fn requeue_sql(storage: &Storage) -> String {
    format!(
        "UPDATE {} SET \"fetchedat\" = NULL WHERE \"id\" = $1",
        storage.table("jobqueue")
    )
}
