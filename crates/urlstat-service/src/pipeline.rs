//! Wires the cache and the dispatcher together to compute stats for a stream of URLs.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::Stream;
use urlstat_cache::{Fetch, SingleFlightCache};
use urlstat_dispatch::{BoundedDispatcher, CancellationToken, StopReason};

use crate::fetch::FetchError;

/// The outcome for one URL of the input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlStat {
    pub url: String,
    pub result: Result<usize, FetchError>,
}

/// Totals of a [`Pipeline::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// The number of URLs that were processed, including failures.
    pub processed: usize,
    /// The number of URLs whose fetch failed.
    pub failed: usize,
    /// The sum of all successfully fetched counts.
    pub total: u64,
    /// Whether the input was cut short by cancellation.
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct Tally {
    processed: AtomicUsize,
    failed: AtomicUsize,
    total: AtomicU64,
}

impl Tally {
    fn record(&self, result: &Result<usize, FetchError>) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(count) => {
                self.total.fetch_add(*count as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Computes a stat for every URL of a stream.
///
/// Every URL is resolved through a [`SingleFlightCache`] around `F`, from a
/// [`BoundedDispatcher`] that runs at most `concurrency` resolutions at a time. Repeated URLs are
/// therefore fetched once, also across multiple runs of the same pipeline.
pub struct Pipeline<F>
where
    F: Fetch<String, Value = usize, Error = FetchError>,
{
    cache: Arc<SingleFlightCache<String, F>>,
    concurrency: NonZeroUsize,
}

impl<F> Pipeline<F>
where
    F: Fetch<String, Value = usize, Error = FetchError> + 'static,
{
    pub fn new(fetch: F, concurrency: NonZeroUsize) -> Self {
        Self {
            cache: Arc::new(SingleFlightCache::new(fetch)),
            concurrency,
        }
    }

    /// The cache all URLs are resolved through.
    pub fn cache(&self) -> &SingleFlightCache<String, F> {
        &self.cache
    }

    /// Processes every URL of `urls`, calling `on_result` as soon as a URL is done.
    ///
    /// Results are reported in completion order, which is not necessarily the input order.
    /// Cancelling `cancel` stops reading `urls`, but URLs that are already being fetched are
    /// still reported.
    pub async fn run<S, R>(&self, urls: S, cancel: CancellationToken, on_result: R) -> Summary
    where
        S: Stream<Item = String> + Send + 'static,
        R: Fn(&UrlStat) + Send + Sync + 'static,
    {
        let tally = Arc::new(Tally::default());
        let on_result = Arc::new(on_result);

        let handler = {
            let cache = Arc::clone(&self.cache);
            let tally = Arc::clone(&tally);
            move |url: String| {
                let cache = Arc::clone(&cache);
                let tally = Arc::clone(&tally);
                let on_result = Arc::clone(&on_result);
                async move {
                    let result = cache.resolve(url.clone()).await;
                    if let Err(err) = &result {
                        tracing::debug!(%url, error = err as &dyn std::error::Error, "Fetch failed");
                    }
                    tally.record(&result);
                    on_result(&UrlStat { url, result });
                }
            }
        };

        let dispatched = BoundedDispatcher::new(self.concurrency)
            .with_cancellation(cancel)
            .spawn(urls, handler)
            .wait()
            .await;

        tracing::debug!(
            admitted = dispatched.admitted,
            cached = self.cache.len(),
            "Pipeline drained"
        );
        if dispatched.panicked > 0 {
            tracing::error!(
                panicked = dispatched.panicked,
                "Some URLs were not reported"
            );
        }

        Summary {
            processed: tally.processed.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            total: tally.total.load(Ordering::Relaxed),
            cancelled: dispatched.stop == StopReason::Cancelled,
        }
    }
}

impl<F> std::fmt::Debug for Pipeline<F>
where
    F: Fetch<String, Value = usize, Error = FetchError>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("cache", &self.cache)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
