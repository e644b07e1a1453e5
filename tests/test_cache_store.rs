//! Integration tests for the cache store
//!
//! Tests cover:
//! - Fresh / stale / expired lifetime on the SQLite and in-memory backends
//! - Last-write-wins upserts, delete and purge
//! - Persistence of the SQLite table across reopen (tempfile)

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use xrpl_ledger_gateway::cache::{
    CacheBackend, CacheStore, ManualClock, MemoryCacheBackend, SqliteCacheBackend,
};

const T0: i64 = 1_700_000_000_000;

async fn sqlite_backend() -> Arc<dyn CacheBackend> {
    Arc::new(SqliteCacheBackend::connect("sqlite::memory:").await.unwrap())
}

fn memory_backend() -> Arc<dyn CacheBackend> {
    Arc::new(MemoryCacheBackend::new())
}

async fn assert_lifetime(backend: Arc<dyn CacheBackend>) {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::with_clock(backend, clock.clone());
    let value = json!({"account": "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY", "balance": "1000"});

    store
        .write(
            "account_info:mainnet:rPEPPER",
            &value,
            Duration::from_millis(5000),
            Some(Duration::from_millis(30000)),
        )
        .await
        .unwrap();

    clock.set(T0 + 4000);
    let hit = store
        .read::<Value>("account_info:mainnet:rPEPPER")
        .await
        .unwrap()
        .expect("fresh entry");
    assert_eq!(hit.value, value);
    assert!(!hit.is_stale);

    clock.set(T0 + 6000);
    let hit = store
        .read::<Value>("account_info:mainnet:rPEPPER")
        .await
        .unwrap()
        .expect("stale entry");
    assert_eq!(hit.value, value);
    assert!(hit.is_stale);

    clock.set(T0 + 31000);
    assert!(store
        .read::<Value>("account_info:mainnet:rPEPPER")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_sqlite_fresh_stale_expired() {
    assert_lifetime(sqlite_backend().await).await;
}

#[tokio::test]
async fn test_memory_fresh_stale_expired() {
    assert_lifetime(memory_backend()).await;
}

#[tokio::test]
async fn test_boundaries_are_inclusive() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::with_clock(sqlite_backend().await, clock.clone());
    store
        .write("k", &1u32, Duration::from_millis(100), Some(Duration::from_millis(200)))
        .await
        .unwrap();

    clock.set(T0 + 100);
    assert!(store.read::<u32>("k").await.unwrap().unwrap().is_stale);
    clock.set(T0 + 200);
    assert!(store.read::<u32>("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_key_reads_none() {
    let store = CacheStore::new(sqlite_backend().await);
    assert!(store.read::<Value>("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_last_write_wins() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::with_clock(sqlite_backend().await, clock.clone());

    store
        .write("nfts:xahau:rA", &json!(["a"]), Duration::from_secs(1), None)
        .await
        .unwrap();
    clock.advance(Duration::from_secs(2));
    store
        .write("nfts:xahau:rA", &json!(["a", "b"]), Duration::from_secs(60), None)
        .await
        .unwrap();

    let hit = store.read::<Value>("nfts:xahau:rA").await.unwrap().unwrap();
    assert_eq!(hit.value, json!(["a", "b"]));
    // The rewrite also renewed freshness.
    assert!(!hit.is_stale);
}

#[tokio::test]
async fn test_delete_and_purge() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::with_clock(sqlite_backend().await, clock.clone());

    store
        .write("short", &"s", Duration::from_secs(1), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    store
        .write("long", &"l", Duration::from_secs(10), None)
        .await
        .unwrap();
    store
        .write("doomed", &"d", Duration::from_secs(10), None)
        .await
        .unwrap();

    store.delete("doomed").await.unwrap();
    assert!(store.read::<String>("doomed").await.unwrap().is_none());

    clock.advance(Duration::from_secs(3));
    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert_eq!(store.purge_expired().await.unwrap(), 0);
    assert_eq!(
        store.read::<String>("long").await.unwrap().unwrap().value,
        "l"
    );
}

#[tokio::test]
async fn test_sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger_cache.db").display());

    let first = SqliteCacheBackend::connect(&url).await.unwrap();
    let store = CacheStore::new(Arc::new(first.clone()));
    store
        .write("server_info:testnet", &json!({"state": "full"}), Duration::from_secs(60), None)
        .await
        .unwrap();
    first.pool().close().await;

    let reopened = CacheStore::sqlite(&url).await.unwrap();
    let hit = reopened
        .read::<Value>("server_info:testnet")
        .await
        .unwrap()
        .expect("persisted entry");
    assert_eq!(hit.value, json!({"state": "full"}));
}
