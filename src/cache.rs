//! # Cache Store
//!
//! Keyed JSON values with a two-tier lifetime:
//!
//! - `now < stale_at`: fresh
//! - `stale_at <= now < expires_at`: stale but usable
//! - `now >= expires_at`: gone
//!
//! Persistence goes through [`CacheBackend`]. [`SqliteCacheBackend`] uses a single
//! `cache(key, value, stale_at, expires_at)` table; [`MemoryCacheBackend`] keeps everything in
//! a `DashMap` for processes without a database. Writes are single-row upserts, so concurrent
//! writers to one key resolve last-write-wins.

use crate::networks::Network;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `max_age` is this many TTLs when not given explicitly.
pub const DEFAULT_MAX_AGE_FACTOR: u32 = 6;

const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Stored row. `value` is JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub stale_at: i64,
    pub expires_at: i64,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Creates whatever schema the backend needs. Safe to call repeatedly.
    async fn init(&self) -> Result<(), CacheError>;

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Deletes `key` only if it is still expired at `now`, so a concurrent rewrite survives.
    async fn evict_expired(&self, key: &str, now: i64) -> Result<(), CacheError>;

    /// Removes every entry with `expires_at <= now`, returning how many went.
    async fn purge_expired(&self, now: i64) -> Result<u64, CacheError>;
}

/// SQLite-backed cache table.
#[derive(Debug, Clone)]
pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    /// Opens (creating if needed) the database at `database_url` and ensures the table exists.
    pub async fn connect(database_url: &str) -> Result<Self, CacheError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            let pool_options = if in_memory {
                // Every connection to `:memory:` is its own database; keep exactly one alive.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                SqlitePoolOptions::new().max_connections(4)
            };

            match pool_options
                .acquire_timeout(Duration::from_secs(5))
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => {
                    let backend = Self { pool };
                    backend.init().await?;
                    info!(
                        "✅ [CacheStore] SQLite cache ready at {} (attempt {}/{})",
                        database_url, attempt, CONNECT_ATTEMPTS
                    );
                    return Ok(backend);
                }
                Err(e) => {
                    warn!(
                        "⚠️ [CacheStore] Cache DB connect attempt {}/{} failed: {}",
                        attempt, CONNECT_ATTEMPTS, e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
        Err(last_err
            .map(CacheError::from)
            .unwrap_or_else(|| CacheError::Unavailable(database_url.to_string())))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn init(&self) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                stale_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache (expires_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT value, stale_at, expires_at FROM cache WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value, stale_at, expires_at)| CacheEntry {
            key: key.to_string(),
            value,
            stale_at,
            expires_at,
        }))
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO cache (key, value, stale_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                stale_at = excluded.stale_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.stale_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict_expired(&self, key: &str, now: i64) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: i64) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn init(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn evict_expired(&self, key: &str, now: i64) -> Result<(), CacheError> {
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(())
    }

    async fn purge_expired(&self, now: i64) -> Result<u64, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

/// Key of a cached ledger view: `kind:network:param...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: &str, network: Network, params: &[&str]) -> Self {
        let mut key = format!("{}:{}", kind, network.as_str());
        for param in params {
            key.push(':');
            key.push_str(param);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading segment, used to label metrics.
    pub fn kind(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// A present entry and whether it is past its TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    pub value: T,
    pub is_stale: bool,
}

/// Typed front of a [`CacheBackend`].
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub async fn sqlite(database_url: &str) -> Result<Self, CacheError> {
        let backend = SqliteCacheBackend::connect(database_url).await?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    /// `None` when the key is missing or expired. Expired rows are evicted on the way out.
    pub async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<CacheRead<T>>, CacheError> {
        let entry = match self.backend.fetch(key).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let now = self.clock.now_millis();
        if now >= entry.expires_at {
            debug!("[CacheStore] {} expired {}ms ago", key, now - entry.expires_at);
            if let Err(e) = self.backend.evict_expired(key, now).await {
                debug!("[CacheStore] Eviction of {} failed: {}", key, e);
            }
            return Ok(None);
        }

        let value = serde_json::from_str(&entry.value)?;
        Ok(Some(CacheRead {
            value,
            is_stale: now >= entry.stale_at,
        }))
    }

    /// Stores `value`, stale after `ttl` and gone after `max_age` (default 6 × `ttl`).
    ///
    /// A `max_age` shorter than `ttl` is raised to `ttl`.
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        max_age: Option<Duration>,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_string(value)?;
        let max_age = max_age
            .unwrap_or_else(|| ttl.saturating_mul(DEFAULT_MAX_AGE_FACTOR))
            .max(ttl);
        let now = self.clock.now_millis();

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            stale_at: now.saturating_add(millis(ttl)),
            expires_at: now.saturating_add(millis(max_age)),
        };
        self.backend.upsert(&entry).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(key).await
    }

    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let removed = self.backend.purge_expired(self.clock.now_millis()).await?;
        if removed > 0 {
            info!("🧹 [CacheStore] Purged {} expired entries", removed);
        }
        Ok(removed)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
