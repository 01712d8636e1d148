use std::{fmt::Debug, hash::Hash, sync::Arc};

/// Identifies one unit of deferred work, for example the id of a link whose description is
/// requested. Two requests are the same request when their keys are equal.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Outcome of a single loader call: either nothing could be fetched at all, or one result per
/// requested key.
pub type BatchResult<V, E> = Result<Vec<Result<V, E>>, E>;

/// Fetches a whole batch of keys in one go.
///
/// `keys` is never empty and never contains duplicates. The returned vector must be positionally
/// aligned with `keys`: the n-th result belongs to the n-th key. A result of a different length is
/// treated as a broken batch and every key of it fails.
///
/// Returning `Err` from the outer result means the loader could not run (storage unreachable,
/// ...), every key of the batch fails with that error. A per-key `Err` only fails that key.
#[async_trait::async_trait]
pub trait Loader<K: Key>: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn load(&self, keys: &[K]) -> BatchResult<Self::Value, Self::Error>;
}

// A loader is typically built once per process, and shared by the dispatchers of each execution.
#[async_trait::async_trait]
impl<K: Key, L: Loader<K>> Loader<K> for Arc<L> {
    type Value = L::Value;
    type Error = L::Error;

    async fn load(&self, keys: &[K]) -> BatchResult<Self::Value, Self::Error> {
        self.as_ref().load(keys).await
    }
}
