//! # Cached Fetch
//!
//! Stale-while-revalidate on top of [`CacheStore`].
//!
//! [`CachedFetcher::cached_fetch`] answers from the cache when it can and never refreshes on its
//! own. [`CachedFetcher::fetch_with_revalidate`] additionally hands a refresh of a stale entry to
//! the [`TaskScheduler`], after the stale value has already been produced for the caller.
//!
//! Cache failures never fail a fetch: they are logged and treated as a miss.

use crate::cache::{CacheKey, CacheStore};
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Result of a cached fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    pub is_stale: bool,
    pub from_cache: bool,
}

impl<T> Fetched<T> {
    fn fresh(data: T) -> Self {
        Self {
            data,
            is_stale: false,
            from_cache: false,
        }
    }
}

/// Runs background refreshes.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(&self, task: BoxFuture<'static, ()>);
}

/// Runs the task to completion before returning.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

#[async_trait]
impl TaskScheduler for InlineScheduler {
    async fn schedule(&self, task: BoxFuture<'static, ()>) {
        task.await;
    }
}

/// Spawns the task and returns immediately. [`DetachedScheduler::flush`] waits for whatever is
/// still running, e.g. before the process exits.
#[derive(Debug, Default)]
pub struct DetachedScheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DetachedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn flush(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("⚠️ [CachedFetch] Background task ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl TaskScheduler for DetachedScheduler {
    async fn schedule(&self, task: BoxFuture<'static, ()>) {
        let handle = tokio::spawn(task);
        let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }
}

/// Releases a key's refresh slot however the refresh ends.
struct RefreshSlot {
    in_flight: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct CachedFetcher {
    store: Option<CacheStore>,
    scheduler: Arc<dyn TaskScheduler>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl CachedFetcher {
    /// Without a store every call goes straight to the fetcher.
    pub fn new(store: Option<CacheStore>, scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            store,
            scheduler,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn uncached() -> Self {
        Self::new(None, Arc::new(InlineScheduler))
    }

    pub fn store(&self) -> Option<&CacheStore> {
        self.store.as_ref()
    }

    pub fn refreshes_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Fresh hit: returned as is. Stale hit: returned flagged `is_stale`. Miss: `fetcher` runs
    /// and its result is written back.
    pub async fn cached_fetch<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        ttl: Duration,
        max_age: Option<Duration>,
    ) -> Result<Fetched<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let store = match &self.store {
            Some(store) => store,
            None => return fetcher().await.map(Fetched::fresh),
        };

        match store.read::<T>(key.as_str()).await {
            Ok(Some(hit)) => {
                if hit.is_stale {
                    debug!("[CachedFetch] Stale hit {}", key);
                    metrics::increment_cache_stale_hit(key.kind());
                } else {
                    debug!("[CachedFetch] Hit {}", key);
                    metrics::increment_cache_hit(key.kind());
                }
                return Ok(Fetched {
                    data: hit.value,
                    is_stale: hit.is_stale,
                    from_cache: true,
                });
            }
            Ok(None) => {
                debug!("[CachedFetch] Miss {}", key);
                metrics::increment_cache_miss(key.kind());
            }
            Err(e) => {
                warn!("⚠️ [CachedFetch] Read of {} failed, fetching fresh: {}", key, e);
                metrics::increment_cache_store_error("read");
            }
        }

        let data = fetcher().await?;
        if let Err(e) = store.write(key.as_str(), &data, ttl, max_age).await {
            warn!("⚠️ [CachedFetch] Write of {} failed: {}", key, e);
            metrics::increment_cache_store_error("write");
        }
        Ok(Fetched::fresh(data))
    }

    /// [`cached_fetch`](Self::cached_fetch), then a scheduled refresh when the answer was stale.
    pub async fn fetch_with_revalidate<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        ttl: Duration,
        max_age: Option<Duration>,
    ) -> Result<Fetched<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fetched = self.cached_fetch(key, &fetcher, ttl, max_age).await?;
        if fetched.is_stale {
            self.revalidate(key, fetcher, ttl, max_age).await;
        }
        Ok(fetched)
    }

    /// Schedules `fetcher` + write for `key`. No-op without a store or while a refresh of the
    /// same key is still running. Failures are logged, never returned.
    pub async fn revalidate<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        ttl: Duration,
        max_age: Option<Duration>,
    ) where
        T: Serialize + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return,
        };
        let key = key.as_str().to_string();
        if self.in_flight.insert(key.clone(), ()).is_some() {
            debug!("[CachedFetch] Refresh of {} already in flight", key);
            return;
        }
        let slot = RefreshSlot {
            in_flight: self.in_flight.clone(),
            key: key.clone(),
        };

        let task = async move {
            let _slot = slot;
            let outcome = match fetcher().await {
                Ok(data) => store
                    .write(&key, &data, ttl, max_age)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(()) => {
                    debug!("[CachedFetch] Refreshed {}", key);
                    metrics::increment_cache_refresh("ok");
                }
                Err(e) => {
                    warn!("⚠️ [CachedFetch] Background refresh of {} failed: {}", key, e);
                    metrics::increment_cache_refresh("error");
                }
            }
        }
        .boxed();

        self.scheduler.schedule(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_detached_scheduler_flush_waits() {
        let scheduler = DetachedScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            scheduler
                .schedule(
                    async move {
                        tokio::task::yield_now().await;
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed(),
                )
                .await;
        }
        scheduler.flush().await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refresh_slot_released_on_drop() {
        let in_flight = Arc::new(DashMap::new());
        in_flight.insert("k".to_string(), ());
        drop(RefreshSlot {
            in_flight: in_flight.clone(),
            key: "k".to_string(),
        });
        assert!(in_flight.is_empty());
    }
}
