use std::future::Future;

use futures::future::{BoxFuture, FutureExt};

/// A keyed computation that may be slow and may fail.
///
/// This is the seam the caches in this crate wrap, and also the interface they expose
/// themselves. Any `Fn(K) -> impl Future<Output = Result<V, E>>` is a `Fetch<K>`.
///
/// Outcomes are handed out to every caller interested in a key, so both the value and the
/// error need to be [`Clone`]. Wrap expensive or non-cloneable types in an `Arc`.
pub trait Fetch<K>: Send + Sync {
    /// The value produced for a key.
    type Value: Clone + Send + Sync + 'static;
    /// The error produced for a key.
    type Error: Clone + Send + Sync + 'static;

    /// Computes the outcome for `key`.
    fn fetch(&self, key: K) -> BoxFuture<'_, Result<Self::Value, Self::Error>>;
}

impl<K, V, E, F, Fut> Fetch<K> for F
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Value = V;
    type Error = E;

    fn fetch(&self, key: K) -> BoxFuture<'_, Result<V, E>> {
        self(key).boxed()
    }
}
