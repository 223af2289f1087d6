//! Integration tests for enqueue / dequeue, covering both claim strategies.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use granary::{Error, JobQueue, Storage, StorageConfig};
use sqlx::postgres::PgPoolOptions;
use support::TestStorage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A storage over a lazy pool that never dials. Lets us assert argument and
/// cancellation handling without a database.
fn offline_storage() -> Arc<Storage> {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://nobody@localhost/unreachable")
        .expect("lazy pool construction is infallible");
    Storage::with_pool(pool, StorageConfig::default()).expect("default config is valid")
}

#[tokio::test]
async fn dequeue_rejects_empty_queue_list() {
    let queue = JobQueue::new(offline_storage());
    let token = CancellationToken::new();

    let err = queue.dequeue(&[], &token).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

#[tokio::test]
async fn dequeue_with_cancelled_token_fails_before_touching_the_database() {
    let queue = JobQueue::new(offline_storage());
    let token = CancellationToken::new();
    token.cancel();

    // The pool is lazy and the URL unreachable, so any database access
    // would surface as Error::Database instead.
    let err = queue.dequeue(&["default"], &token).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

async fn fetches_the_enqueued_job(native: bool) {
    let Some(fixture) = TestStorage::new(native).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    let job_id = Uuid::new_v4();
    queue
        .enqueue(storage.pool(), "default", job_id)
        .await
        .unwrap();

    let fetched = queue.dequeue(&["default"], &token).await.unwrap();
    assert_eq!(fetched.job_id(), job_id);
    assert_eq!(fetched.queue(), "default");

    // The entry is invisible, not gone.
    let rows = support::queue_rows(&storage).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].fetchedat.is_some());

    fetched.remove_from_queue().await.unwrap();
    fixture.teardown().await;
}

#[tokio::test]
async fn locking_strategy_fetches_the_enqueued_job() {
    fetches_the_enqueued_job(true).await;
}

#[tokio::test]
async fn versioned_strategy_fetches_the_enqueued_job() {
    fetches_the_enqueued_job(false).await;
}

async fn fetches_in_enqueue_order(native: bool) {
    let Some(fixture) = TestStorage::new(native).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    queue.enqueue(storage.pool(), "default", first).await.unwrap();
    queue.enqueue(storage.pool(), "default", second).await.unwrap();

    let a = queue.dequeue(&["default"], &token).await.unwrap();
    let b = queue.dequeue(&["default"], &token).await.unwrap();
    assert_eq!(a.job_id(), first);
    assert_eq!(b.job_id(), second);

    a.remove_from_queue().await.unwrap();
    b.remove_from_queue().await.unwrap();
    fixture.teardown().await;
}

#[tokio::test]
async fn locking_strategy_fetches_in_enqueue_order() {
    fetches_in_enqueue_order(true).await;
}

#[tokio::test]
async fn versioned_strategy_fetches_in_enqueue_order() {
    fetches_in_enqueue_order(false).await;
}

async fn refetches_a_timed_out_entry(native: bool) {
    let Some(fixture) = TestStorage::new(native).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    // Fetched a day ago, far past the 30 minute invisibility timeout.
    let job_id = Uuid::new_v4();
    let stale = Utc::now() - chrono::Duration::days(1);
    support::seed_queue_entry(&storage, "default", job_id, Some(stale)).await;

    let fetched = queue.dequeue(&["default"], &token).await.unwrap();
    assert_eq!(fetched.job_id(), job_id);

    fetched.remove_from_queue().await.unwrap();
    fixture.teardown().await;
}

#[tokio::test]
async fn locking_strategy_refetches_a_timed_out_entry() {
    refetches_a_timed_out_entry(true).await;
}

#[tokio::test]
async fn versioned_strategy_refetches_a_timed_out_entry() {
    refetches_a_timed_out_entry(false).await;
}

async fn parallel_dequeuers_claim_distinct_entries(native: bool) {
    let Some(fixture) = TestStorage::new(native).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = Arc::new(JobQueue::new(storage.clone()));
    let token = CancellationToken::new();

    let mut expected = std::collections::HashSet::new();
    for _ in 0..8 {
        let job_id = Uuid::new_v4();
        expected.insert(job_id);
        queue.enqueue(storage.pool(), "default", job_id).await.unwrap();
    }

    // One worker per entry. A double claim would leave some other worker
    // blocked with nothing left to fetch, tripping the timeout below.
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue(&["default"], &token).await })
        })
        .collect();

    let mut claimed = std::collections::HashSet::new();
    for worker in workers {
        let fetched = tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("every worker should claim an entry")
            .expect("worker task should not panic")
            .unwrap();
        assert!(
            claimed.insert(fetched.job_id()),
            "entry for job {} was claimed twice",
            fetched.job_id()
        );
        fetched.remove_from_queue().await.unwrap();
    }
    assert_eq!(claimed, expected);
    fixture.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locking_strategy_parallel_dequeuers_claim_distinct_entries() {
    parallel_dequeuers_claim_distinct_entries(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versioned_strategy_parallel_dequeuers_claim_distinct_entries() {
    parallel_dequeuers_claim_distinct_entries(false).await;
}

#[tokio::test]
async fn dequeue_ignores_other_queues() {
    let Some(fixture) = TestStorage::new(true).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    queue
        .enqueue(storage.pool(), "critical", Uuid::new_v4())
        .await
        .unwrap();

    let attempt = tokio::time::timeout(
        Duration::from_millis(300),
        queue.dequeue(&["default"], &token),
    )
    .await;
    assert!(attempt.is_err(), "a job in another queue must not be claimed");

    let rows = support::queue_rows(&storage).await;
    assert!(rows[0].fetchedat.is_none());
    fixture.teardown().await;
}

#[tokio::test]
async fn dequeue_spans_multiple_queues() {
    let Some(fixture) = TestStorage::new(true).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    let job_id = Uuid::new_v4();
    queue.enqueue(storage.pool(), "critical", job_id).await.unwrap();

    let fetched = queue
        .dequeue(&["default", "critical"], &token)
        .await
        .unwrap();
    assert_eq!(fetched.job_id(), job_id);
    assert_eq!(fetched.queue(), "critical");

    fetched.remove_from_queue().await.unwrap();
    fixture.teardown().await;
}

#[tokio::test]
async fn remove_from_queue_deletes_the_entry() {
    let Some(fixture) = TestStorage::new(true).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    queue
        .enqueue(storage.pool(), "default", Uuid::new_v4())
        .await
        .unwrap();
    let fetched = queue.dequeue(&["default"], &token).await.unwrap();
    fetched.remove_from_queue().await.unwrap();

    assert_eq!(support::count_rows(&storage, "jobqueue").await, 0);
    fixture.teardown().await;
}

#[tokio::test]
async fn requeue_makes_the_entry_visible_again() {
    let Some(fixture) = TestStorage::new(true).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    let job_id = Uuid::new_v4();
    queue.enqueue(storage.pool(), "default", job_id).await.unwrap();
    let fetched = queue.dequeue(&["default"], &token).await.unwrap();
    fetched.requeue().await.unwrap();

    let rows = support::queue_rows(&storage).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].fetchedat.is_none());

    // Still claimable.
    let again = queue.dequeue(&["default"], &token).await.unwrap();
    assert_eq!(again.job_id(), job_id);
    again.remove_from_queue().await.unwrap();
    fixture.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_an_unsettled_fetch_requeues_it() {
    let Some(fixture) = TestStorage::new(true).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = JobQueue::new(storage.clone());
    let token = CancellationToken::new();

    queue
        .enqueue(storage.pool(), "default", Uuid::new_v4())
        .await
        .unwrap();
    let fetched = queue.dequeue(&["default"], &token).await.unwrap();
    drop(fetched);

    // The requeue runs on a spawned task.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let rows = support::queue_rows(&storage).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].fetchedat.is_none());
    fixture.teardown().await;
}

#[tokio::test]
async fn dequeue_wakes_when_a_commit_signals_the_queue() {
    let Some(fixture) = TestStorage::new(true).await else {
        return;
    };
    let storage = fixture.storage.clone();
    let queue = Arc::new(JobQueue::new(storage.clone()));
    let token = CancellationToken::new();

    let waiter = {
        let queue = queue.clone();
        let token = token.clone();
        tokio::spawn(async move { queue.dequeue(&["default"], &token).await })
    };
    // Let the waiter reach its idle wait before anything is enqueued.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let job_id = Uuid::new_v4();
    let mut tx = granary::WriteOnlyTransaction::new(storage.clone());
    tx.add_to_queue("default", job_id);
    tx.commit().await.unwrap();

    let fetched = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("dequeue should wake promptly")
        .expect("waiter task should not panic")
        .unwrap();
    assert_eq!(fetched.job_id(), job_id);

    fetched.remove_from_queue().await.unwrap();
    fixture.teardown().await;
}
