use std::{borrow::Cow, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{info_span, Instrument};

use crate::{
    cache::ValueCache, config::DataLoaderConfig, scheduler::BatchSource, Key, LoadError, Loader, PendingLoad,
    PendingValue,
};

/// Collects the keys requested during one batch window and fetches them with a single loader call.
///
/// A dispatcher is cheap to clone, clones share the same batch window. It is meant to live for one
/// execution and be registered with the [`ResolutionScheduler`](crate::ResolutionScheduler)
/// driving it, which decides when to flush.
pub struct Dispatcher<K: Key, L: Loader<K>> {
    inner: Arc<Inner<K, L>>,
}

impl<K: Key, L: Loader<K>> Clone for Dispatcher<K, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K: Key, L: Loader<K>> {
    name: Cow<'static, str>,
    loader: L,
    config: DataLoaderConfig,
    cache: Option<ValueCache<K, L::Value>>,
    state: Mutex<State<K, PendingLoad<K, L>>>,
    // Flushes of one dispatcher never overlap, generation N+1 only starts once N is settled.
    flush_lock: futures::lock::Mutex<()>,
}

struct State<K, P> {
    /// Id of the generation currently accumulating keys.
    generation: u64,
    /// Insertion order is the order in which keys were first requested.
    queued: IndexMap<K, P>,
    in_flight: IndexMap<K, P>,
    cancelled: bool,
}

impl<K: Key, L: Loader<K>> Dispatcher<K, L> {
    pub fn new(name: impl Into<Cow<'static, str>>, loader: L) -> Self {
        Self::with_config(name, loader, DataLoaderConfig::default())
    }

    pub fn with_config(name: impl Into<Cow<'static, str>>, loader: L, config: DataLoaderConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                loader,
                cache: ValueCache::from_config(&config.cache),
                config,
                state: Mutex::new(State {
                    generation: 0,
                    queued: IndexMap::new(),
                    in_flight: IndexMap::new(),
                    cancelled: false,
                }),
                flush_lock: futures::lock::Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// Registers interest in `key` for the current batch window. Never blocks and never calls the
    /// loader, the returned value settles once the window is flushed.
    ///
    /// Requesting a key already queued in the current window returns the same value.
    pub fn load(&self, key: K) -> PendingLoad<K, L> {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return PendingValue::failed(LoadError::Cancelled);
        }

        if let Some(value) = self.inner.cache.as_ref().and_then(|cache| cache.get(&key)) {
            tracing::trace!(loader = %self.inner.name, ?key, "Cache hit");
            return PendingValue::resolved(value);
        }

        if let Some(pending) = state.queued.get(&key) {
            return pending.clone();
        }

        // Keys being fetched right now are only shared when results may outlive their window.
        if self.inner.cache.is_some() {
            if let Some(pending) = state.in_flight.get(&key) {
                return pending.clone();
            }
        }

        if state.queued.is_empty() {
            tracing::trace!(loader = %self.inner.name, generation = state.generation, "Starting a new batch window");
        }

        let pending = PendingValue::new();
        state.queued.insert(key, pending.clone());
        pending
    }

    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Vec<PendingLoad<K, L>> {
        keys.into_iter().map(|key| self.load(key)).collect()
    }

    /// Settles `key` with `value` without asking the loader.
    ///
    /// A key queued in the current window is resolved and removed from the batch. Otherwise the
    /// value is only remembered if the cache is enabled.
    pub fn prime(&self, key: K, value: L::Value) {
        let queued = self.inner.state.lock().queued.shift_remove(&key);

        if let Some(pending) = queued {
            pending.settle(Ok(value.clone()));
        }

        if let Some(cache) = &self.inner.cache {
            cache.insert(key, value);
        }
    }

    /// Drops a cached value, the next load of `key` will hit the loader again.
    pub fn forget(&self, key: &K) {
        if let Some(cache) = &self.inner.cache {
            cache.invalidate(key);
        }
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    /// Whether keys are waiting for the next flush.
    pub fn has_pending(&self) -> bool {
        !self.inner.state.lock().queued.is_empty()
    }

    /// Fetches every key queued in the current batch window and settles their values. A new
    /// window starts for any key requested afterwards, or while the fetch is in progress.
    pub async fn flush(&self) {
        let _guard = self.inner.flush_lock.lock().await;

        let (generation, keys, values) = {
            let mut state = self.inner.state.lock();
            if state.queued.is_empty() {
                return;
            }

            let generation = state.generation;
            state.generation += 1;
            state.in_flight = std::mem::take(&mut state.queued);

            let keys: Vec<K> = state.in_flight.keys().cloned().collect();
            let values: Vec<PendingLoad<K, L>> = state.in_flight.values().cloned().collect();

            (generation, keys, values)
        };
        let _window = InFlightWindow {
            inner: &self.inner,
            values: &values,
        };

        let span = info_span!(
            "dataloader flush",
            loader = %self.inner.name,
            generation,
            keys = keys.len()
        );

        async {
            let chunk_size = self.inner.config.max_batch_size.map(|n| n.get()).unwrap_or(keys.len());
            tracing::debug!(chunks = keys.len().div_ceil(chunk_size), "Flushing batch window");

            let chunks = keys
                .chunks(chunk_size)
                .zip(values.chunks(chunk_size))
                .map(|(keys, values)| self.load_chunk(keys, values));

            futures::future::join_all(chunks).await;
        }
        .instrument(span)
        .await;
    }

    /// Fetches one chunk of a batch window. The chunk is its own loader call: a loader failure or a
    /// mismatched number of results only fails the keys of this chunk, other chunks of the window
    /// keep their results.
    async fn load_chunk(&self, keys: &[K], values: &[PendingLoad<K, L>]) {
        match self.inner.loader.load(keys).await {
            Ok(results) if results.len() == keys.len() => {
                for ((key, pending), result) in keys.iter().zip(values).zip(results) {
                    match result {
                        Ok(value) => {
                            let cached = self.inner.cache.as_ref().map(|cache| (cache, value.clone()));
                            // Results for a cancelled window are discarded.
                            if pending.settle(Ok(value)) {
                                if let Some((cache, value)) = cached {
                                    cache.insert(key.clone(), value);
                                }
                            }
                        }
                        Err(err) => {
                            tracing::debug!(?key, "Failed to load key: {err}");
                            pending.settle(Err(LoadError::KeyFetchFailed {
                                key: key.clone(),
                                cause: Arc::new(err),
                            }));
                        }
                    }
                }
            }
            Ok(results) => {
                let (expected, actual) = (keys.len(), results.len());
                tracing::error!(expected, actual, "Batch loader returned a mismatched number of results");

                for pending in values {
                    pending.settle(Err(LoadError::BatchContractViolation { expected, actual }));
                }
            }
            Err(err) => {
                tracing::warn!(keys = keys.len(), "Batch loader failed: {err}");

                let cause = Arc::new(err);
                for pending in values {
                    pending.settle(Err(LoadError::BatchLoaderUnavailable(Arc::clone(&cause))));
                }
            }
        }
    }

    /// Fails every value that is still waiting with [`LoadError::Cancelled`], including those of a
    /// window being fetched. Later loads fail right away.
    pub fn cancel(&self) {
        let values: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.cancelled = true;
            let queued = std::mem::take(&mut state.queued);
            queued
                .into_values()
                .chain(state.in_flight.values().cloned())
                .collect()
        };

        let cancelled = values
            .into_iter()
            .filter(|pending| pending.settle(Err(LoadError::Cancelled)))
            .count();

        if cancelled > 0 {
            tracing::debug!(loader = %self.inner.name, cancelled, "Cancelled pending loads");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }
}

/// Ends the in-flight window of a flush, even when the flush future is dropped before the loader
/// answered. Values it leaves unsettled fail with [`LoadError::Cancelled`].
struct InFlightWindow<'a, K: Key, L: Loader<K>> {
    inner: &'a Inner<K, L>,
    values: &'a [PendingLoad<K, L>],
}

impl<K: Key, L: Loader<K>> Drop for InFlightWindow<'_, K, L> {
    fn drop(&mut self) {
        self.inner.state.lock().in_flight.clear();

        let abandoned = self
            .values
            .iter()
            .filter(|pending| pending.settle(Err(LoadError::Cancelled)))
            .count();

        if abandoned > 0 {
            tracing::debug!(loader = %self.inner.name, abandoned, "Flush dropped before the loader answered");
        }
    }
}

impl<K: Key, L: Loader<K>> BatchSource for Dispatcher<K, L> {
    fn name(&self) -> &str {
        Dispatcher::name(self)
    }

    fn has_pending(&self) -> bool {
        Dispatcher::has_pending(self)
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        Dispatcher::flush(self).boxed()
    }

    fn cancel(&self) {
        Dispatcher::cancel(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    use super::Dispatcher;
    use crate::{BatchResult, DataLoaderConfig, LoadError, Loader, PendingState};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Error(&'static str);

    /// Squares numbers, fails on 13 and records every call.
    #[derive(Default)]
    struct Squares {
        calls: Mutex<Vec<Vec<u64>>>,
    }

    #[async_trait::async_trait]
    impl Loader<u64> for Squares {
        type Value = u64;
        type Error = Error;

        async fn load(&self, keys: &[u64]) -> BatchResult<u64, Error> {
            self.calls.lock().push(keys.to_vec());
            Ok(keys
                .iter()
                .map(|&key| if key == 13 { Err(Error("unlucky")) } else { Ok(key * key) })
                .collect())
        }
    }

    fn dispatcher(config: DataLoaderConfig) -> (Arc<Squares>, Dispatcher<u64, Arc<Squares>>) {
        let loader = Arc::new(Squares::default());
        (loader.clone(), Dispatcher::with_config("squares", loader, config))
    }

    #[tokio::test]
    async fn deduplicates_in_first_seen_order() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default());

        let values = dispatcher.load_many([3, 1, 3, 2, 1]);
        assert!(values[0].ptr_eq(&values[2]));
        assert!(values[1].ptr_eq(&values[4]));
        assert!(dispatcher.has_pending());

        dispatcher.flush().await;
        assert!(!dispatcher.has_pending());

        assert_eq!(*loader.calls.lock(), vec![vec![3, 1, 2]]);
        let results: Vec<_> = values.iter().map(|value| value.try_get().unwrap().unwrap()).collect();
        assert_eq!(results, vec![9, 1, 9, 4, 1]);
    }

    #[tokio::test]
    async fn flushing_nothing_does_not_call_the_loader() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default());
        dispatcher.flush().await;
        assert!(loader.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn split_by_max_batch_size() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default().with_max_batch_size(2));

        let values = dispatcher.load_many([1, 2, 3, 4, 5]);
        dispatcher.flush().await;

        assert_eq!(*loader.calls.lock(), vec![vec![1, 2], vec![3, 4], vec![5]]);
        let results: Vec<_> = values.into_iter().map(|value| value.try_get().unwrap().unwrap()).collect();
        assert_eq!(results, vec![1, 4, 9, 16, 25]);
    }

    #[tokio::test]
    async fn without_cache_every_window_fetches_again() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default());

        let first = dispatcher.load(2);
        dispatcher.flush().await;
        let second = dispatcher.load(2);
        assert!(!first.ptr_eq(&second));
        dispatcher.flush().await;

        assert_eq!(*loader.calls.lock(), vec![vec![2], vec![2]]);
        assert_eq!(second.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn cache_reuses_earlier_windows_but_not_failures() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default().with_cache(16));

        dispatcher.load_many([2, 13]);
        dispatcher.flush().await;

        let cached = dispatcher.load(2);
        assert_eq!(cached.state(), PendingState::Resolved);
        let failed_again = dispatcher.load(13);
        assert_eq!(failed_again.state(), PendingState::Unresolved);
        dispatcher.flush().await;

        assert_eq!(*loader.calls.lock(), vec![vec![2, 13], vec![13]]);
        assert!(matches!(failed_again.await, Err(LoadError::KeyFetchFailed { key: 13, .. })));

        dispatcher.forget(&2);
        dispatcher.load(2);
        assert!(dispatcher.has_pending());
    }

    #[tokio::test]
    async fn prime_settles_queued_keys() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default().with_cache(16));

        let primed = dispatcher.load(4);
        let fetched = dispatcher.load(5);
        dispatcher.prime(4, 400);
        dispatcher.prime(6, 600);

        assert_eq!(primed.try_get().unwrap().unwrap(), 400);
        assert_eq!(dispatcher.load(6).try_get().unwrap().unwrap(), 600);

        dispatcher.flush().await;
        assert_eq!(*loader.calls.lock(), vec![vec![5]]);
        assert_eq!(fetched.await.unwrap(), 25);

        dispatcher.clear_cache();
        assert_eq!(dispatcher.load(6).state(), PendingState::Unresolved);
    }

    struct Gated {
        gate: Arc<Semaphore>,
    }

    #[async_trait::async_trait]
    impl Loader<u64> for Gated {
        type Value = u64;
        type Error = Error;

        async fn load(&self, keys: &[u64]) -> BatchResult<u64, Error> {
            let _permit = self.gate.acquire().await.map_err(|_| Error("closed"))?;
            Ok(keys.iter().map(|&key| Ok(key)).collect())
        }
    }

    #[tokio::test]
    async fn results_of_a_cancelled_window_are_discarded() {
        let gate = Arc::new(Semaphore::new(0));
        let dispatcher = Dispatcher::with_config(
            "gated",
            Gated { gate: gate.clone() },
            DataLoaderConfig::default().with_cache(16),
        );

        let value = dispatcher.load(3);
        let flush = dispatcher.flush();
        futures::pin_mut!(flush);
        assert!(futures::poll!(flush.as_mut()).is_pending());

        dispatcher.cancel();
        gate.add_permits(1);
        flush.await;

        assert!(value.try_get().unwrap().unwrap_err().is_cancelled());
        let cache = dispatcher.inner.cache.as_ref().unwrap();
        assert_eq!(cache.get(&3), None);
    }

    #[tokio::test]
    async fn in_flight_keys_are_shared_when_caching() {
        let gate = Arc::new(Semaphore::new(0));
        let dispatcher = Dispatcher::with_config(
            "gated",
            Gated { gate: gate.clone() },
            DataLoaderConfig::default().with_cache(16),
        );

        let value = dispatcher.load(3);
        let flush = dispatcher.flush();
        futures::pin_mut!(flush);
        assert!(futures::poll!(flush.as_mut()).is_pending());

        assert!(dispatcher.load(3).ptr_eq(&value));
        assert!(!dispatcher.has_pending());

        gate.add_permits(1);
        flush.await;
        assert_eq!(value.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn dropping_a_flush_ends_its_window() {
        let dispatcher = Dispatcher::new(
            "gated",
            Gated {
                gate: Arc::new(Semaphore::new(0)),
            },
        );

        let value = dispatcher.load(3);
        let mut flush = Box::pin(dispatcher.flush());
        assert!(futures::poll!(flush.as_mut()).is_pending());
        drop(flush);

        assert!(value.try_get().unwrap().unwrap_err().is_cancelled());
        assert!(dispatcher.inner.state.lock().in_flight.is_empty());
        assert!(!dispatcher.is_cancelled());

        let retried = dispatcher.load(3);
        assert!(!retried.ptr_eq(&value));
        assert_eq!(retried.state(), PendingState::Unresolved);
        assert!(dispatcher.has_pending());
    }

    /// Answers with no results at all for any batch containing 7.
    struct Picky;

    #[async_trait::async_trait]
    impl Loader<u64> for Picky {
        type Value = u64;
        type Error = Error;

        async fn load(&self, keys: &[u64]) -> BatchResult<u64, Error> {
            if keys.contains(&7) {
                return Ok(Vec::new());
            }
            Ok(keys.iter().map(|&key| Ok(key)).collect())
        }
    }

    #[tokio::test]
    async fn mismatched_chunk_only_fails_its_own_keys() {
        let dispatcher = Dispatcher::with_config("picky", Picky, DataLoaderConfig::default().with_max_batch_size(2));

        let values = dispatcher.load_many([1, 2, 7, 8]);
        dispatcher.flush().await;

        assert_eq!(values[0].try_get().unwrap().unwrap(), 1);
        assert_eq!(values[1].try_get().unwrap().unwrap(), 2);
        for value in &values[2..] {
            let err = value.try_get().unwrap().unwrap_err();
            assert!(
                matches!(err, LoadError::BatchContractViolation { expected: 2, actual: 0 }),
                "{err:?}"
            );
        }
    }

    #[tokio::test]
    async fn cancel_fails_waiting_values_and_later_loads() {
        let (loader, dispatcher) = dispatcher(DataLoaderConfig::default());

        let value = dispatcher.load(1);
        dispatcher.cancel();

        assert!(dispatcher.is_cancelled());
        assert!(value.await.unwrap_err().is_cancelled());
        assert!(dispatcher.load(2).try_get().unwrap().unwrap_err().is_cancelled());

        dispatcher.flush().await;
        assert!(loader.calls.lock().is_empty());
    }
}
