//! # Request Queue
//!
//! FIFO queue pacing outbound ledger calls to a fixed ceiling (20/s ⇒ one dispatch every 50ms).
//!
//! - Requests are dispatched strictly in enqueue order, one at a time.
//! - A single drain task runs at a time; enqueueing while it drains does not start another.
//! - A failing (or panicking) request settles only its own caller.
//! - A caller that drops its future still consumes its slot and its rate-limit tick.
//!
//! Pacing is a `governor` direct limiter with a burst of one. The drain task is its only
//! waiter, so the limiter never reorders requests.

use crate::error::LedgerError;
use crate::metrics;
use futures::future::BoxFuture;
use futures::FutureExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, warn};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default ceiling on dispatches per second.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 20;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// One unit of queued work.
struct QueuedRequest {
    execute: Job,
    created_at: Instant,
}

struct QueueShared {
    pending: Mutex<VecDeque<QueuedRequest>>,
    draining: AtomicBool,
    /// `None` when the interval is zero, i.e. unpaced.
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    min_interval: Duration,
}

/// Rate-limited FIFO for ledger calls. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<QueueShared>,
}

impl RequestQueue {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1);
        Self::with_min_interval(Duration::from_secs(1) / rps)
    }

    /// One dispatch per `min_interval`, never bursting.
    pub fn with_min_interval(min_interval: Duration) -> Self {
        let limiter = Quota::with_period(min_interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            shared: Arc::new(QueueShared {
                pending: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                limiter,
                min_interval,
            }),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.shared.min_interval
    }

    pub fn len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `execute` to the queue and returns a future for its outcome.
    ///
    /// The request is admitted when this is called, not when the returned future is first
    /// polled, so call order is dispatch order.
    pub fn enqueue<T, F, Fut>(&self, execute: F) -> impl Future<Output = Result<T, LedgerError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LedgerError>> + Send + 'static,
    {
        let (settle_tx, settle_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(async move { execute().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(LedgerError::internal("queued request panicked")));
                let _ = settle_tx.send(outcome);
            }
            .boxed()
        });

        let depth = {
            let mut pending = self.shared.pending();
            pending.push_back(QueuedRequest {
                execute: job,
                created_at: Instant::now(),
            });
            pending.len()
        };
        metrics::set_queue_depth(depth);
        self.start_drain();

        async move {
            settle_rx
                .await
                .unwrap_or_else(|_| Err(LedgerError::internal("request queue dropped the request")))
        }
    }

    fn start_drain(&self) {
        if self.shared.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.drain().await;
        });
    }
}

impl QueueShared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drain(&self) {
        loop {
            let next = self.pending().pop_front();
            let request = match next {
                Some(request) => request,
                None => {
                    self.draining.store(false, Ordering::Release);
                    // Work may have arrived between the pop and the store above.
                    if !self.pending().is_empty() && !self.draining.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    return;
                }
            };

            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            let dispatched_at = Instant::now();

            let waited = dispatched_at.duration_since(request.created_at);
            metrics::record_queue_wait(waited);
            metrics::set_queue_depth(self.pending().len());
            if waited > Duration::from_secs(5) {
                warn!(
                    "⚠️ [RequestQueue] Request waited {:?} before dispatch ({} still queued)",
                    waited,
                    self.pending().len()
                );
            } else {
                debug!("[RequestQueue] Dispatching after {:?}", waited);
            }

            (request.execute)().await;
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerErrorKind;

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(RequestQueue::new(20).min_interval(), Duration::from_millis(50));
        assert_eq!(RequestQueue::new(0).min_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_interval_is_unpaced() {
        let queue = RequestQueue::with_min_interval(Duration::ZERO);
        assert!(queue.shared.limiter.is_none());
        assert!(RequestQueue::new(20).shared.limiter.is_some());
    }

    #[tokio::test]
    async fn test_panicking_request_is_isolated() {
        let queue = RequestQueue::new(100);
        let boom = queue.enqueue(|| async {
            if true {
                panic!("boom");
            }
            Ok::<_, LedgerError>(0u32)
        });
        let fine = queue.enqueue(|| async { Ok::<_, LedgerError>(7u32) });

        let err = boom.await.unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::InternalError);
        assert_eq!(fine.await.unwrap(), 7);
    }
}
