use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::Fetch;

type Outcome<K, F> = Result<<F as Fetch<K>>::Value, <F as Fetch<K>>::Error>;

/// The in-flight marker of a key.
///
/// Waiters hold a receiver. The resolver holds the only sender and never sends anything:
/// dropping it closes the channel, which wakes every waiter at once.
type Marker = watch::Receiver<()>;

struct State<K, V, E> {
    /// Resolved outcomes. Entries are never updated or removed.
    entries: HashMap<K, Result<V, E>>,
    /// Keys that are currently being resolved.
    ///
    /// A key is never in both maps at the same time.
    in_flight: HashMap<K, Marker>,
}

enum Lookup<V, E> {
    Cached(Result<V, E>),
    Join(Marker),
    Resolve(watch::Sender<()>),
}

/// An in-memory cache for keyed computations that coalesces concurrent requests.
///
/// The first caller for a key becomes its resolver and runs the wrapped [`Fetch`]. Every caller
/// that asks for the same key while that computation is running waits for it and receives a
/// clone of the very same outcome. Once resolved, the outcome is served from memory for the
/// lifetime of the cache without calling into the wrapped computation again.
///
/// Errors are treated exactly like values: they are cached and replayed verbatim, and never
/// retried.
///
/// The internal lock is only held for map lookups and updates, never while the wrapped
/// computation runs or while waiting, so resolving one key never blocks other keys.
///
/// If a resolver is dropped or panics before its computation completes, no entry is written and
/// the waiters are released. They then retry the lookup and one of them takes over the
/// computation.
///
/// The cache implements [`Fetch`] itself and can be used wherever the wrapped computation could.
pub struct SingleFlightCache<K, F: Fetch<K>> {
    fetch: F,
    state: Mutex<State<K, F::Value, F::Error>>,
}

impl<K, F> SingleFlightCache<K, F>
where
    K: Eq + Hash + Clone,
    F: Fetch<K>,
{
    /// Creates a new cache around the given computation.
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            state: Mutex::new(State {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Returns the outcome for `key`, computing it at most once.
    pub async fn resolve(&self, key: K) -> Outcome<K, F> {
        loop {
            let mut marker = match self.lookup(&key) {
                Lookup::Cached(outcome) => return outcome,
                Lookup::Resolve(done) => return self.compute(key, done).await,
                Lookup::Join(marker) => marker,
            };

            tracing::trace!("Joining in-flight computation");
            // Nothing is ever sent, so this only returns once the resolver closed the channel.
            // At that point the entry is either written, or the computation was abandoned.
            let _ = marker.changed().await;
        }
    }

    /// The number of resolved keys.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Returns `true` if no key has been resolved yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of keys that are currently being resolved.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    fn state(&self) -> MutexGuard<'_, State<K, F::Value, F::Error>> {
        // The lock is never held across user code that could leave the maps half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &K) -> Lookup<F::Value, F::Error> {
        let mut state = self.state();

        if let Some(outcome) = state.entries.get(key) {
            tracing::trace!("Serving cached outcome");
            return Lookup::Cached(outcome.clone());
        }

        if let Some(marker) = state.in_flight.get(key) {
            return Lookup::Join(marker.clone());
        }

        let (done, marker) = watch::channel(());
        state.in_flight.insert(key.clone(), marker);
        Lookup::Resolve(done)
    }

    async fn compute(&self, key: K, done: watch::Sender<()>) -> Outcome<K, F> {
        tracing::trace!("Starting deduplicated computation");

        let token = InFlight {
            cache: self,
            key: key.clone(),
            done: Some(done),
        };

        let outcome = self.fetch.fetch(key).await;
        token.complete(outcome.clone());

        outcome
    }
}

/// Marks the resolver of a key.
///
/// Completing the token stores the outcome. Dropping it without completing releases the waiters
/// without storing anything.
struct InFlight<'a, K, F>
where
    K: Eq + Hash + Clone,
    F: Fetch<K>,
{
    cache: &'a SingleFlightCache<K, F>,
    key: K,
    done: Option<watch::Sender<()>>,
}

impl<K, F> InFlight<'_, K, F>
where
    K: Eq + Hash + Clone,
    F: Fetch<K>,
{
    fn complete(mut self, outcome: Outcome<K, F>) {
        let mut state = self.cache.state();
        state.entries.insert(self.key.clone(), outcome);
        state.in_flight.remove(&self.key);
        // waiters must only be woken once the entry is visible to them
        drop(self.done.take());
    }
}

impl<K, F> Drop for InFlight<'_, K, F>
where
    K: Eq + Hash + Clone,
    F: Fetch<K>,
{
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };

        tracing::warn!("Computation was abandoned before completion, releasing waiters");
        let mut state = self.cache.state();
        state.in_flight.remove(&self.key);
        drop(done);
    }
}

impl<K, F> Fetch<K> for SingleFlightCache<K, F>
where
    K: Eq + Hash + Clone + Send,
    F: Fetch<K>,
{
    type Value = F::Value;
    type Error = F::Error;

    fn fetch(&self, key: K) -> BoxFuture<'_, Outcome<K, F>> {
        Box::pin(self.resolve(key))
    }
}

impl<K, F: Fetch<K>> fmt::Debug for SingleFlightCache<K, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, in_flight) = self
            .state
            .try_lock()
            .map(|state| (state.entries.len(), state.in_flight.len()))
            .unwrap_or_default();
        f.debug_struct("SingleFlightCache")
            .field("entries", &entries)
            .field("in_flight", &in_flight)
            .finish()
    }
}
