//! Integration tests for the request queue
//!
//! Tests cover:
//! - FIFO dispatch order under concurrent submission
//! - Minimum spacing between dispatches (20/s => 50ms)
//! - Failure isolation between queued requests
//! - Abandoned requests still consuming their slot
//!
//! The limiter runs on the wall clock, so these tests measure real time and allow a little
//! slack for timer granularity.

use futures::future::{join_all, ready, Ready};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use xrpl_ledger_gateway::{LedgerError, LedgerErrorKind, RequestQueue};

/// Tolerance between the limiter's clock and tokio's.
const SLACK: Duration = Duration::from_millis(2);
const GAP: Duration = Duration::from_millis(50);

type DispatchLog = Arc<Mutex<Vec<(usize, Instant)>>>;

fn recorder(
    log: &DispatchLog,
    index: usize,
) -> impl FnOnce() -> Ready<Result<usize, LedgerError>> + Send + 'static {
    let log = log.clone();
    move || {
        log.lock().unwrap().push((index, Instant::now()));
        ready(Ok(index))
    }
}

#[tokio::test]
async fn test_twenty_five_requests_at_twenty_per_second() {
    let queue = RequestQueue::new(20);
    let log: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    let pending: Vec<_> = (0..25).map(|i| queue.enqueue(recorder(&log, i))).collect();
    let results = join_all(pending).await;
    let elapsed = started.elapsed();

    let results: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(results, (0..25).collect::<Vec<_>>());

    // 24 gaps of 50ms
    assert!(elapsed + SLACK >= GAP * 24, "took {:?}", elapsed);

    let log = log.lock().unwrap();
    let order: Vec<usize> = log.iter().map(|(i, _)| *i).collect();
    assert_eq!(order, (0..25).collect::<Vec<_>>());
    for pair in log.windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap + SLACK >= GAP, "gap {:?}", gap);
    }
}

#[tokio::test]
async fn test_requests_from_many_tasks_are_spaced() {
    let queue = RequestQueue::new(20);
    let log: DispatchLog = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let fut = queue.enqueue(recorder(&log, i));
            tokio::spawn(fut)
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 10);
    let order: Vec<usize> = log.iter().map(|(i, _)| *i).collect();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
    for pair in log.windows(2) {
        assert!(pair[1].1.duration_since(pair[0].1) + SLACK >= GAP);
    }
}

#[tokio::test]
async fn test_failure_settles_only_its_caller() {
    let queue = RequestQueue::new(20);

    let first = queue.enqueue(|| async { Ok::<_, LedgerError>("first") });
    let failing = queue.enqueue(|| async {
        Err::<&str, _>(LedgerError::new(
            LedgerErrorKind::AccountNotFound,
            "no such account",
        ))
    });
    let last = queue.enqueue(|| async { Ok::<_, LedgerError>("last") });

    assert_eq!(first.await.unwrap(), "first");
    assert_eq!(
        failing.await.unwrap_err().kind,
        LedgerErrorKind::AccountNotFound
    );
    assert_eq!(last.await.unwrap(), "last");
}

#[tokio::test]
async fn test_abandoned_request_keeps_its_slot() {
    let queue = RequestQueue::new(20);
    let log: DispatchLog = Arc::new(Mutex::new(Vec::new()));

    let first = queue.enqueue(recorder(&log, 0));
    let abandoned = queue.enqueue(recorder(&log, 1));
    let third = queue.enqueue(recorder(&log, 2));
    drop(abandoned);

    first.await.unwrap();
    third.await.unwrap();

    let log = log.lock().unwrap();
    let order: Vec<usize> = log.iter().map(|(i, _)| *i).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert!(log[2].1.duration_since(log[0].1) + SLACK >= GAP * 2);
}

#[tokio::test]
async fn test_idle_queue_restarts_draining() {
    let queue = RequestQueue::new(20);

    assert_eq!(queue.enqueue(|| async { Ok::<_, LedgerError>(1u8) }).await.unwrap(), 1);
    assert!(queue.is_empty());

    tokio::time::sleep(GAP * 4).await;
    let started = Instant::now();
    assert_eq!(queue.enqueue(|| async { Ok::<_, LedgerError>(2u8) }).await.unwrap(), 2);
    // The previous dispatch is long past, so its tick has been replenished.
    assert!(started.elapsed() < GAP);
}
