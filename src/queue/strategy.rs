//! Claim-one-eligible-entry strategies.
//!
//! Both strategies share the same eligibility predicate and ordering; they
//! differ only in how they guarantee that at most one concurrent fetcher
//! owns a given row. The pessimistic strategy leans on row locks
//! (`FOR UPDATE SKIP LOCKED`); the optimistic one re-reads and performs a
//! compare-and-swap on a version counter. Which one runs is decided once,
//! from configuration, at queue construction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::{retry_serialization, Storage};

/// Version counters wrap at this modulus to avoid integer overflow. A
/// false-positive compare-and-swap would need exactly this many updates to
/// one row inside a single visibility window; treated as a practical bound,
/// not a proof.
const VERSION_MODULUS: i64 = 2_000_000_000;

/// A queue entry successfully claimed by this process.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ClaimedEntry {
    pub id: Uuid,
    #[sqlx(rename = "jobid")]
    pub job_id: Uuid,
    pub queue: String,
}

/// One attempt at claiming a single eligible queue entry.
///
/// `Ok(None)` means nothing eligible was found and the caller should wait;
/// lost races are resolved internally and never surface as `None`.
#[async_trait]
pub(crate) trait ClaimStrategy: Send + Sync {
    async fn claim(&self, storage: &Storage, queues: &[String]) -> Result<Option<ClaimedEntry>>;
}

/// Eligibility: never fetched, or fetched so long ago that the original
/// worker must have died. Ordering gives stale entries and FIFO-per-queue
/// fairness: fetched-at NULLS FIRST, then queue name, then insertion order.
const ELIGIBLE: &str = "WHERE \"queue\" = ANY($1) \
     AND (\"fetchedat\" IS NULL OR \"fetchedat\" < $2) \
     ORDER BY \"fetchedat\" NULLS FIRST, \"queue\", \"serialid\" \
     LIMIT 1";

/// Cut-off before which a fetched-at timestamp counts as abandoned.
fn eligibility_threshold(invisibility_timeout: Duration) -> DateTime<Utc> {
    let window =
        chrono::Duration::from_std(invisibility_timeout).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Pessimistic strategy: a dedicated read-committed transaction selects one
/// eligible row with `FOR UPDATE SKIP LOCKED` (rows already claimed by
/// concurrent fetchers are stepped over, not waited on), stamps fetched-at
/// and commits. Serialization conflicts retry the whole attempt without
/// consuming a wait cycle.
pub(crate) struct LockingClaim {
    fetch_sql: String,
}

impl LockingClaim {
    pub(crate) fn new(storage: &Storage) -> Self {
        let jobqueue = storage.table("jobqueue");
        Self {
            fetch_sql: format!(
                "UPDATE {jobqueue} SET \"fetchedat\" = now() \
                 WHERE \"id\" = (SELECT \"id\" FROM {jobqueue} {ELIGIBLE} FOR UPDATE SKIP LOCKED) \
                 RETURNING \"id\", \"jobid\", \"queue\""
            ),
        }
    }
}

#[async_trait]
impl ClaimStrategy for LockingClaim {
    async fn claim(&self, storage: &Storage, queues: &[String]) -> Result<Option<ClaimedEntry>> {
        retry_serialization(|| async {
            let threshold = eligibility_threshold(storage.config().invisibility_timeout);
            let mut tx = storage.begin().await?;

            let claimed = sqlx::query_as::<_, ClaimedEntry>(&self.fetch_sql)
                .bind(queues)
                .bind(threshold)
                .fetch_optional(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(claimed)
        })
        .await
    }
}

/// Candidate read by the optimistic strategy before its conditional update.
#[derive(Debug, sqlx::FromRow)]
struct CandidateEntry {
    id: Uuid,
    updatecount: i64,
}

/// Optimistic strategy: read one eligible candidate without any exclusive
/// lock, then accept it only if a conditional update on (id, version) hits
/// exactly one row. A miss means another fetcher won the race; the
/// read-then-update cycle repeats immediately.
pub(crate) struct VersionedClaim {
    select_sql: String,
    cas_sql: String,
}

impl VersionedClaim {
    pub(crate) fn new(storage: &Storage) -> Self {
        let jobqueue = storage.table("jobqueue");
        Self {
            select_sql: format!(
                "SELECT \"id\", \"updatecount\" FROM {jobqueue} {ELIGIBLE}"
            ),
            cas_sql: format!(
                "UPDATE {jobqueue} \
                 SET \"fetchedat\" = now(), \"updatecount\" = (\"updatecount\" + 1) % {VERSION_MODULUS} \
                 WHERE \"id\" = $1 AND \"updatecount\" = $2 \
                 RETURNING \"id\", \"jobid\", \"queue\""
            ),
        }
    }
}

#[async_trait]
impl ClaimStrategy for VersionedClaim {
    async fn claim(&self, storage: &Storage, queues: &[String]) -> Result<Option<ClaimedEntry>> {
        loop {
            let threshold = eligibility_threshold(storage.config().invisibility_timeout);

            let candidate = sqlx::query_as::<_, CandidateEntry>(&self.select_sql)
                .bind(queues)
                .bind(threshold)
                .fetch_optional(storage.pool())
                .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query_as::<_, ClaimedEntry>(&self.cas_sql)
                .bind(candidate.id)
                .bind(candidate.updatecount)
                .fetch_optional(storage.pool())
                .await?;

            match claimed {
                Some(entry) => return Ok(Some(entry)),
                // Lost the race; re-read right away rather than waiting.
                None => continue,
            }
        }
    }
}
