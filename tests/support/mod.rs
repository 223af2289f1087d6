//! Shared fixture for database-backed tests.
//!
//! Tests run against the database named by `GRANARY_TEST_DATABASE_URL` and
//! are skipped (with a note on stderr) when it is unset. Each fixture
//! installs a throwaway schema so parallel test binaries never collide, and
//! drops it on teardown.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use granary::{Storage, StorageConfig};
use uuid::Uuid;

const ENV_VAR: &str = "GRANARY_TEST_DATABASE_URL";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestStorage {
    pub storage: Arc<Storage>,
    schema: String,
}

impl TestStorage {
    /// Connect with a fresh schema, or `None` when no test database is
    /// configured. `use_native_transactions` selects the dequeue strategy.
    pub async fn new(use_native_transactions: bool) -> Option<Self> {
        init_tracing();
        let Ok(url) = std::env::var(ENV_VAR) else {
            eprintln!("skipping database test: {ENV_VAR} is not set");
            return None;
        };

        let schema = format!("granary_test_{}", Uuid::new_v4().simple());
        let config = StorageConfig {
            schema_name: schema.clone(),
            queue_poll_interval: Duration::from_millis(100),
            allow_unsafe_values: true,
            use_native_transactions,
            ..StorageConfig::default()
        };

        let storage = Storage::connect(&url, config)
            .await
            .expect("test database should be reachable");
        install_schema(&storage, &schema).await;

        Some(Self { storage, schema })
    }

    pub async fn teardown(self) {
        let sql = format!("DROP SCHEMA \"{}\" CASCADE", self.schema);
        sqlx::query(&sql)
            .execute(self.storage.pool())
            .await
            .expect("teardown should drop the test schema");
    }
}

async fn install_schema(storage: &Storage, schema: &str) {
    let statements = [
        format!("CREATE SCHEMA \"{schema}\""),
        format!(
            "CREATE TABLE \"{schema}\".\"jobqueue\" (\
               \"id\" uuid PRIMARY KEY DEFAULT gen_random_uuid(), \
               \"jobid\" uuid NOT NULL, \
               \"queue\" text NOT NULL, \
               \"fetchedat\" timestamptz, \
               \"updatecount\" bigint NOT NULL DEFAULT 0, \
               \"serialid\" bigserial\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"job\" (\
               \"id\" uuid PRIMARY KEY, \
               \"stateid\" uuid, \
               \"statename\" text, \
               \"createdat\" timestamptz NOT NULL DEFAULT now(), \
               \"expireat\" timestamptz\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"state\" (\
               \"id\" uuid PRIMARY KEY DEFAULT gen_random_uuid(), \
               \"jobid\" uuid NOT NULL, \
               \"name\" text NOT NULL, \
               \"reason\" text, \
               \"createdat\" timestamptz NOT NULL, \
               \"data\" jsonb\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"counter\" (\
               \"id\" bigserial PRIMARY KEY, \
               \"key\" text NOT NULL, \
               \"value\" bigint NOT NULL, \
               \"expireat\" timestamptz\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"aggregatedcounter\" (\
               \"id\" bigserial PRIMARY KEY, \
               \"key\" text NOT NULL UNIQUE, \
               \"value\" bigint NOT NULL, \
               \"expireat\" timestamptz\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"set\" (\
               \"id\" uuid PRIMARY KEY DEFAULT gen_random_uuid(), \
               \"key\" text NOT NULL, \
               \"value\" text NOT NULL, \
               \"score\" float8 NOT NULL DEFAULT 0.0, \
               \"expireat\" timestamptz, \
               \"serialid\" bigserial, \
               UNIQUE (\"key\", \"value\")\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"list\" (\
               \"id\" uuid PRIMARY KEY DEFAULT gen_random_uuid(), \
               \"key\" text NOT NULL, \
               \"value\" text NOT NULL, \
               \"expireat\" timestamptz, \
               \"serialid\" bigserial\
             )"
        ),
        format!(
            "CREATE TABLE \"{schema}\".\"hash\" (\
               \"id\" uuid PRIMARY KEY DEFAULT gen_random_uuid(), \
               \"key\" text NOT NULL, \
               \"field\" text NOT NULL, \
               \"value\" text NOT NULL, \
               \"expireat\" timestamptz, \
               UNIQUE (\"key\", \"field\")\
             )"
        ),
    ];

    for sql in statements {
        sqlx::query(&sql)
            .execute(storage.pool())
            .await
            .expect("schema installation should succeed");
    }
}

/// One row of the jobqueue table, as the tests inspect it.
#[derive(Debug, sqlx::FromRow)]
pub struct QueueRow {
    pub id: Uuid,
    pub jobid: Uuid,
    pub queue: String,
    pub fetchedat: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn queue_rows(storage: &Storage) -> Vec<QueueRow> {
    let sql = format!(
        "SELECT \"id\", \"jobid\", \"queue\", \"fetchedat\" FROM {} ORDER BY \"serialid\"",
        storage.table("jobqueue")
    );
    sqlx::query_as(&sql)
        .fetch_all(storage.pool())
        .await
        .expect("queue rows should be readable")
}

/// Insert a queue entry directly, optionally with a pre-set fetched-at.
pub async fn seed_queue_entry(
    storage: &Storage,
    queue: &str,
    job_id: Uuid,
    fetched_at: Option<chrono::DateTime<chrono::Utc>>,
) {
    let sql = format!(
        "INSERT INTO {} (\"jobid\", \"queue\", \"fetchedat\") VALUES ($1, $2, $3)",
        storage.table("jobqueue")
    );
    sqlx::query(&sql)
        .bind(job_id)
        .bind(queue)
        .bind(fetched_at)
        .execute(storage.pool())
        .await
        .expect("seeding a queue entry should succeed");
}

pub async fn seed_counter(storage: &Storage, key: &str, value: i64, expire_at: Option<chrono::DateTime<chrono::Utc>>) {
    let sql = format!(
        "INSERT INTO {} (\"key\", \"value\", \"expireat\") VALUES ($1, $2, $3)",
        storage.table("counter")
    );
    sqlx::query(&sql)
        .bind(key)
        .bind(value)
        .bind(expire_at)
        .execute(storage.pool())
        .await
        .expect("seeding a counter row should succeed");
}

pub async fn count_rows(storage: &Storage, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", storage.table(table));
    sqlx::query_scalar(&sql)
        .fetch_one(storage.pool())
        .await
        .expect("row count should be readable")
}
