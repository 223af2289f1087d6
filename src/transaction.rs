//! Write-only transaction batch.
//!
//! Every mutation the background-job framework performs against storage is
//! expressed as an operation on [`WriteOnlyTransaction`]. Calls append
//! commands to an ordered queue without touching the database; `commit`
//! replays them against a single transaction and applies them atomically.
//! Queues touched by `add_to_queue` are signaled only once the commit is
//! known to have succeeded, so workers are woken after durability is
//! certain, never before.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::Storage;

type Command = Box<dyn for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<()>> + Send>;

/// A state a job moves into, recorded append-then-point: each transition
/// inserts an immutable history row and repoints the job's current-state
/// columns in one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub name: String,
    pub reason: Option<String>,
    pub data: serde_json::Value,
}

impl JobState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Completion guard returned by [`WriteOnlyTransaction::commit_in`].
///
/// When the batch runs inside a caller-managed transaction, only the caller
/// knows when (and whether) that transaction commits. Call
/// [`committed`](Self::committed) after it does; dropping the guard without
/// calling it fires no signals, so a rollback never wakes workers for jobs
/// that were never durably queued.
#[must_use = "call committed() once the surrounding transaction has committed"]
pub struct CommitSignal {
    storage: Arc<Storage>,
    queues: Vec<String>,
}

impl CommitSignal {
    /// Fire the queue signals, exactly once per distinct touched queue.
    pub fn committed(self) {
        let distinct: BTreeSet<&str> = self.queues.iter().map(String::as_str).collect();
        for queue in distinct {
            self.storage.signals().notify(queue);
        }
    }
}

/// Ordered batch of mutating operations, committed as one atomic unit.
pub struct WriteOnlyTransaction {
    storage: Arc<Storage>,
    commands: Vec<Command>,
    queues_with_added_jobs: Vec<String>,
}

impl WriteOnlyTransaction {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            commands: Vec::new(),
            queues_with_added_jobs: Vec::new(),
        }
    }

    fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    fn simple<B>(&mut self, sql: String, bind: B)
    where
        B: for<'q> FnOnce(
                sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
            ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>
            + Send
            + 'static,
    {
        self.push(Box::new(move |conn| {
            Box::pin(async move {
                bind(sqlx::query(&sql)).execute(&mut *conn).await?;
                Ok(())
            })
        }));
    }

    // ── job ────────────────────────────────────────────────────────────

    /// Schedule the job row for deletion once `expire_in` has passed.
    pub fn expire_job(&mut self, job_id: Uuid, expire_in: Duration) {
        let sql = format!(
            "UPDATE {} SET \"expireat\" = $2 WHERE \"id\" = $1",
            self.storage.table("job")
        );
        let expire_at = expiry(expire_in);
        self.simple(sql, move |q| q.bind(job_id).bind(expire_at));
    }

    /// Clear the job row's expiration so it is kept indefinitely.
    pub fn persist_job(&mut self, job_id: Uuid) {
        let sql = format!(
            "UPDATE {} SET \"expireat\" = NULL WHERE \"id\" = $1",
            self.storage.table("job")
        );
        self.simple(sql, move |q| q.bind(job_id));
    }

    /// Record a state transition and repoint the job's current state, in one
    /// statement: full history is preserved while point lookups stay O(1).
    pub fn set_job_state(&mut self, job_id: Uuid, state: JobState) {
        let sql = format!(
            "WITH \"s\" AS (\
               INSERT INTO {state} (\"jobid\", \"name\", \"reason\", \"createdat\", \"data\") \
               VALUES ($1, $2, $3, $4, $5) RETURNING \"id\"\
             ) \
             UPDATE {job} \"j\" SET \"stateid\" = \"s\".\"id\", \"statename\" = $2 \
             FROM \"s\" WHERE \"j\".\"id\" = $1",
            state = self.storage.table("state"),
            job = self.storage.table("job"),
        );
        let created_at = Utc::now();
        self.simple(sql, move |q| {
            q.bind(job_id)
                .bind(state.name)
                .bind(state.reason)
                .bind(created_at)
                .bind(state.data)
        });
    }

    /// Record a state in the history without making it the current one.
    pub fn add_job_state(&mut self, job_id: Uuid, state: JobState) {
        let sql = format!(
            "INSERT INTO {} (\"jobid\", \"name\", \"reason\", \"createdat\", \"data\") \
             VALUES ($1, $2, $3, $4, $5)",
            self.storage.table("state")
        );
        let created_at = Utc::now();
        self.simple(sql, move |q| {
            q.bind(job_id)
                .bind(state.name)
                .bind(state.reason)
                .bind(created_at)
                .bind(state.data)
        });
    }

    // ── queue ──────────────────────────────────────────────────────────

    /// Enqueue the job; the queue name is signaled after a successful commit.
    pub fn add_to_queue(&mut self, queue: impl Into<String>, job_id: Uuid) {
        let queue = queue.into();
        let sql = crate::queue::enqueue_sql(&self.storage);
        {
            let queue = queue.clone();
            self.simple(sql, move |q| q.bind(job_id).bind(queue));
        }
        self.queues_with_added_jobs.push(queue);
    }

    // ── counters ───────────────────────────────────────────────────────

    pub fn increment_counter(&mut self, key: impl Into<String>) {
        self.counter_delta(key.into(), 1, None);
    }

    pub fn increment_counter_in(&mut self, key: impl Into<String>, expire_in: Duration) {
        self.counter_delta(key.into(), 1, Some(expiry(expire_in)));
    }

    pub fn decrement_counter(&mut self, key: impl Into<String>) {
        self.counter_delta(key.into(), -1, None);
    }

    pub fn decrement_counter_in(&mut self, key: impl Into<String>, expire_in: Duration) {
        self.counter_delta(key.into(), -1, Some(expiry(expire_in)));
    }

    fn counter_delta(&mut self, key: String, delta: i64, expire_at: Option<DateTime<Utc>>) {
        let sql = format!(
            "INSERT INTO {} (\"key\", \"value\", \"expireat\") VALUES ($1, $2, $3)",
            self.storage.table("counter")
        );
        self.simple(sql, move |q| q.bind(key).bind(delta).bind(expire_at));
    }

    // ── sets ───────────────────────────────────────────────────────────

    pub fn add_to_set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.add_to_set_scored(key, value, 0.0);
    }

    /// Upsert: an existing (key, value) pair only has its score replaced.
    pub fn add_to_set_scored(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        score: f64,
    ) {
        let sql = format!(
            "INSERT INTO {} (\"key\", \"value\", \"score\") VALUES ($1, $2, $3) \
             ON CONFLICT (\"key\", \"value\") DO UPDATE SET \"score\" = EXCLUDED.\"score\"",
            self.storage.table("set")
        );
        let (key, value) = (key.into(), value.into());
        self.simple(sql, move |q| q.bind(key).bind(value).bind(score));
    }

    pub fn add_range_to_set(&mut self, key: impl Into<String>, values: Vec<String>) {
        let sql = format!(
            "INSERT INTO {} (\"key\", \"value\", \"score\") VALUES ($1, $2, 0.0)",
            self.storage.table("set")
        );
        let key = key.into();
        self.push(Box::new(move |conn| {
            Box::pin(async move {
                for value in values {
                    sqlx::query(&sql)
                        .bind(&key)
                        .bind(value)
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        }));
    }

    pub fn remove_from_set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let sql = format!(
            "DELETE FROM {} WHERE \"key\" = $1 AND \"value\" = $2",
            self.storage.table("set")
        );
        let (key, value) = (key.into(), value.into());
        self.simple(sql, move |q| q.bind(key).bind(value));
    }

    pub fn remove_set(&mut self, key: impl Into<String>) {
        let sql = format!(
            "DELETE FROM {} WHERE \"key\" = $1",
            self.storage.table("set")
        );
        let key = key.into();
        self.simple(sql, move |q| q.bind(key));
    }

    pub fn expire_set(&mut self, key: impl Into<String>, expire_in: Duration) {
        self.expire_key("set", key.into(), expire_in);
    }

    pub fn persist_set(&mut self, key: impl Into<String>) {
        self.persist_key("set", key.into());
    }

    // ── lists ──────────────────────────────────────────────────────────

    pub fn insert_to_list(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let sql = format!(
            "INSERT INTO {} (\"key\", \"value\") VALUES ($1, $2)",
            self.storage.table("list")
        );
        let (key, value) = (key.into(), value.into());
        self.simple(sql, move |q| q.bind(key).bind(value));
    }

    pub fn remove_from_list(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let sql = format!(
            "DELETE FROM {} WHERE \"key\" = $1 AND \"value\" = $2",
            self.storage.table("list")
        );
        let (key, value) = (key.into(), value.into());
        self.simple(sql, move |q| q.bind(key).bind(value));
    }

    /// Keep only the rows within `[keep_start, keep_end]` counted by reverse
    /// insertion order per key; everything else is deleted in one statement.
    pub fn trim_list(&mut self, key: impl Into<String>, keep_start: i64, keep_end: i64) {
        let sql = format!(
            "DELETE FROM {list} AS source \
             WHERE \"key\" = $1 AND \"id\" NOT IN (\
               SELECT \"id\" FROM {list} AS keep \
               WHERE keep.\"key\" = source.\"key\" \
               ORDER BY \"serialid\" DESC \
               OFFSET $2 LIMIT $3\
             )",
            list = self.storage.table("list"),
        );
        let key = key.into();
        let limit = (keep_end - keep_start + 1).max(0);
        self.simple(sql, move |q| q.bind(key).bind(keep_start).bind(limit));
    }

    pub fn expire_list(&mut self, key: impl Into<String>, expire_in: Duration) {
        self.expire_key("list", key.into(), expire_in);
    }

    pub fn persist_list(&mut self, key: impl Into<String>) {
        self.persist_key("list", key.into());
    }

    // ── hashes ─────────────────────────────────────────────────────────

    pub fn set_range_in_hash(
        &mut self,
        key: impl Into<String>,
        pairs: Vec<(String, String)>,
    ) {
        let sql = format!(
            "INSERT INTO {} (\"key\", \"field\", \"value\") VALUES ($1, $2, $3) \
             ON CONFLICT (\"key\", \"field\") DO UPDATE SET \"value\" = EXCLUDED.\"value\"",
            self.storage.table("hash")
        );
        let key = key.into();
        self.push(Box::new(move |conn| {
            Box::pin(async move {
                for (field, value) in pairs {
                    sqlx::query(&sql)
                        .bind(&key)
                        .bind(field)
                        .bind(value)
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        }));
    }

    pub fn remove_hash(&mut self, key: impl Into<String>) {
        let sql = format!(
            "DELETE FROM {} WHERE \"key\" = $1",
            self.storage.table("hash")
        );
        let key = key.into();
        self.simple(sql, move |q| q.bind(key));
    }

    pub fn expire_hash(&mut self, key: impl Into<String>, expire_in: Duration) {
        self.expire_key("hash", key.into(), expire_in);
    }

    pub fn persist_hash(&mut self, key: impl Into<String>) {
        self.persist_key("hash", key.into());
    }

    fn expire_key(&mut self, table: &str, key: String, expire_in: Duration) {
        let sql = format!(
            "UPDATE {} SET \"expireat\" = $2 WHERE \"key\" = $1",
            self.storage.table(table)
        );
        let expire_at = expiry(expire_in);
        self.simple(sql, move |q| q.bind(key).bind(expire_at));
    }

    fn persist_key(&mut self, table: &str, key: String) {
        let sql = format!(
            "UPDATE {} SET \"expireat\" = NULL WHERE \"key\" = $1",
            self.storage.table(table)
        );
        self.simple(sql, move |q| q.bind(key));
    }

    // ── commit ─────────────────────────────────────────────────────────

    /// Open one transaction, replay every queued command in order and commit
    /// atomically. Touched queues are signaled only after the commit
    /// succeeds.
    pub async fn commit(self) -> Result<()> {
        let storage = self.storage.clone();
        let mut tx = storage.begin().await?;
        let signal = self.replay(&mut tx).await?;
        tx.commit().await?;
        signal.committed();
        Ok(())
    }

    /// Replay the batch on a caller-managed transaction.
    ///
    /// The caller controls when the surrounding transaction commits, so the
    /// returned [`CommitSignal`] carries the touched queues; fire it after
    /// the commit succeeds.
    pub async fn commit_in(self, tx: &mut Transaction<'_, Postgres>) -> Result<CommitSignal> {
        self.replay(tx).await
    }

    async fn replay(self, tx: &mut Transaction<'_, Postgres>) -> Result<CommitSignal> {
        let count = self.commands.len();
        for command in self.commands {
            command(&mut *tx).await?;
        }
        debug!(commands = count, "write-only transaction replayed");

        Ok(CommitSignal {
            storage: self.storage,
            queues: self.queues_with_added_jobs,
        })
    }
}

fn expiry(expire_in: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(expire_in).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
