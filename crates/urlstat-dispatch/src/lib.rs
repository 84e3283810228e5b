//! Bounded-concurrency dispatching of keyed work.
//!
//! A [`BoundedDispatcher`] consumes a stream of keys and runs a handler for each of them on a
//! task of its own, with at most a fixed number of handlers running at the same time. Keys are
//! only pulled from the stream once there is room for another handler, so a slow handler
//! throttles whoever produces the keys.
//!
//! The dispatcher does not look at what handlers do. If a handler needs to report an outcome,
//! it has to do so itself.

#![warn(missing_docs)]

use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub use tokio_util::sync::CancellationToken;

/// Why a dispatcher stopped taking in keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The key stream was exhausted.
    Exhausted,
    /// The dispatcher was cancelled.
    Cancelled,
    /// Polling the key stream panicked.
    Failed,
}

/// What a dispatcher did, returned once it has drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSummary {
    /// The number of keys that were handed to the handler.
    pub admitted: usize,
    /// The number of handler invocations that panicked.
    pub panicked: usize,
    /// Why the intake stopped.
    pub stop: StopReason,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicUsize,
    panicked: AtomicUsize,
}

/// Runs a handler for every key of a stream, with a bound on concurrently running handlers.
///
/// The bound is an admission quota of `limit` permits. A permit is taken before a handler is
/// spawned and given back when it returns. Taking the permit happens on the same sequential path
/// that reads the key stream, so there are never more than `limit` handlers in flight, no matter
/// how fast keys arrive.
///
/// Cancellation only stops the intake of new keys. Handlers that are already running are never
/// interrupted, and [`DispatchHandle::wait`] still waits for them.
#[derive(Clone, Debug)]
pub struct BoundedDispatcher {
    limit: u32,
    cancel: CancellationToken,
}

impl BoundedDispatcher {
    /// Creates a dispatcher that runs at most `limit` handlers at a time.
    pub fn new(limit: NonZeroUsize) -> Self {
        let limit = limit
            .get()
            .min(Semaphore::MAX_PERMITS)
            .min(u32::MAX as usize) as u32;

        Self {
            limit,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops the intake once `cancel` is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The maximum number of concurrently running handlers.
    pub fn limit(&self) -> usize {
        self.limit as usize
    }

    /// Starts consuming `keys` on the current runtime, calling `handler` for each of them.
    ///
    /// Returns a handle to wait for the dispatcher to drain.
    pub fn spawn<K, S, H, Fut>(self, keys: S, handler: H) -> DispatchHandle
    where
        K: Send + 'static,
        S: Stream<Item = K> + Send + 'static,
        H: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let quota = Arc::new(Semaphore::new(self.limit as usize));
        let counters = Arc::new(Counters::default());

        let intake = tokio::spawn(intake(
            keys,
            Arc::new(handler),
            Arc::clone(&quota),
            Arc::clone(&counters),
            self.cancel.clone(),
        ));

        DispatchHandle {
            intake,
            quota,
            limit: self.limit,
            counters,
            cancel: self.cancel,
        }
    }
}

async fn intake<K, S, H, Fut>(
    keys: S,
    handler: Arc<H>,
    quota: Arc<Semaphore>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> StopReason
where
    K: Send + 'static,
    S: Stream<Item = K>,
    H: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut keys = pin!(keys);

    loop {
        let key = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StopReason::Cancelled,
            key = keys.next() => match key {
                Some(key) => key,
                None => return StopReason::Exhausted,
            },
        };

        // The next key is only pulled after this one got a permit.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Dispatcher cancelled while waiting for quota, dropping key");
                return StopReason::Cancelled;
            }
            permit = Arc::clone(&quota).acquire_owned() => match permit {
                Ok(permit) => permit,
                // the quota is never closed
                Err(_) => return StopReason::Cancelled,
            },
        };

        counters.admitted.fetch_add(1, Ordering::Relaxed);

        let handler = Arc::clone(&handler);
        let counters = Arc::clone(&counters);
        tokio::spawn(async move {
            let handled = AssertUnwindSafe(async move { handler(key).await })
                .catch_unwind()
                .await;

            if handled.is_err() {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Dispatched handler panicked");
            }

            drop(permit);
        });
    }
}

/// A running [`BoundedDispatcher`].
#[derive(Debug)]
pub struct DispatchHandle {
    intake: JoinHandle<StopReason>,
    quota: Arc<Semaphore>,
    limit: u32,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl DispatchHandle {
    /// Stops the intake of new keys.
    ///
    /// Handlers that are already running continue until they are done.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token that stops the intake of this dispatcher.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The number of keys handed to the handler so far.
    pub fn admitted(&self) -> usize {
        self.counters.admitted.load(Ordering::Relaxed)
    }

    /// The number of handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.limit as usize - self.quota.available_permits()
    }

    /// Waits until the intake has stopped and every admitted handler has returned.
    pub async fn wait(self) -> DispatchSummary {
        let stop = match self.intake.await {
            Ok(stop) => stop,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Dispatcher intake failed"
                );
                StopReason::Failed
            }
        };

        // Every admitted handler holds a permit until it returns, so by acquiring *all* the
        // permits we wait for all outstanding handlers to finish.
        let _permits = self.quota.acquire_many(self.limit).await;

        DispatchSummary {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use tokio::time::{self, Duration};

    use super::*;

    fn limit(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let handler = {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let completed = Arc::clone(&completed);
            move |_key: u32| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                let completed = Arc::clone(&completed);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);

                    time::sleep(Duration::from_millis(100)).await;

                    active.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let summary = BoundedDispatcher::new(limit(5))
            .spawn(stream::iter(0..100), handler)
            .wait()
            .await;

        assert_eq!(max_active.load(Ordering::SeqCst), 5);
        assert_eq!(completed.load(Ordering::SeqCst), 100);
        assert_eq!(
            summary,
            DispatchSummary {
                admitted: 100,
                panicked: 0,
                stop: StopReason::Exhausted,
            }
        );
    }

    #[tokio::test]
    async fn test_drains_all_keys() {
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = BoundedDispatcher::new(limit(2)).spawn(stream::iter(0..10_000), {
            let calls = Arc::clone(&calls);
            move |_key: usize| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        let summary = handle.wait().await;

        assert_eq!(calls.load(Ordering::SeqCst), 10_000);
        assert_eq!(summary.admitted, 10_000);
        assert_eq!(summary.stop, StopReason::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_waits_for_running_handlers() {
        let (keys, rx) = futures::channel::mpsc::unbounded::<u32>();
        let started = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let handle = BoundedDispatcher::new(limit(2))
            .with_cancellation(cancel.clone())
            .spawn(rx, {
                let started = Arc::clone(&started);
                let completed = Arc::clone(&completed);
                move |_key| {
                    let started = Arc::clone(&started);
                    let completed = Arc::clone(&completed);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        time::sleep(Duration::from_secs(1)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

        for key in 0..5 {
            keys.unbounded_send(key).unwrap();
        }
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(handle.in_flight(), 2);

        cancel.cancel();
        keys.unbounded_send(5).unwrap();
        let summary = handle.wait().await;

        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(
            summary,
            DispatchSummary {
                admitted: 2,
                panicked: 0,
                stop: StopReason::Cancelled,
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_before_intake() {
        let handle =
            BoundedDispatcher::new(limit(3)).spawn(stream::iter(0..10), |_key: u32| async {});
        handle.cancel();
        assert!(handle.cancellation_token().is_cancelled());

        let summary = handle.wait().await;
        assert_eq!(summary.admitted, 0);
        assert_eq!(summary.stop, StopReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intake_is_throttled_by_quota() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let keys = stream::iter(0..10u32).inspect({
            let pulled = Arc::clone(&pulled);
            move |_key| {
                pulled.fetch_add(1, Ordering::SeqCst);
            }
        });
        let handle = BoundedDispatcher::new(limit(1)).spawn(keys, {
            let gate = Arc::clone(&gate);
            move |_key| {
                let gate = Arc::clone(&gate);
                async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
            }
        });

        time::sleep(Duration::from_millis(10)).await;
        // one key is being handled, the next one waits for quota
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
        assert_eq!(handle.admitted(), 1);
        assert_eq!(handle.in_flight(), 1);

        gate.add_permits(10);
        let summary = handle.wait().await;

        assert_eq!(pulled.load(Ordering::SeqCst), 10);
        assert_eq!(summary.admitted, 10);
    }

    #[tokio::test]
    async fn test_panicking_handler_releases_quota() {
        let completed = Arc::new(AtomicUsize::new(0));

        let handle = BoundedDispatcher::new(limit(1)).spawn(stream::iter(0..4u32), {
            let completed = Arc::clone(&completed);
            move |key| {
                let completed = Arc::clone(&completed);
                async move {
                    if key == 1 {
                        panic!("handler failed for key {key}");
                    }
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        let summary = handle.wait().await;

        assert_eq!(completed.load(Ordering::SeqCst), 3);
        assert_eq!(
            summary,
            DispatchSummary {
                admitted: 4,
                panicked: 1,
                stop: StopReason::Exhausted,
            }
        );
    }
}
