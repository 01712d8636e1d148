use crate::{config::CacheConfig, Key};

/// Values resolved by earlier batch windows of the same dispatcher. Only successful results are
/// kept, failures are fetched again when requested again.
pub(crate) struct ValueCache<K, V> {
    inner: mini_moka::sync::Cache<K, V>,
}

impl<K: Key, V: Clone + Send + Sync + 'static> ValueCache<K, V> {
    pub(crate) fn from_config(config: &CacheConfig) -> Option<Self> {
        if !config.enabled || config.limit == 0 {
            return None;
        }

        Some(ValueCache {
            inner: mini_moka::sync::Cache::builder().max_capacity(config.limit).build(),
        })
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub(crate) fn invalidate(&self, key: &K) {
        self.inner.invalidate(key);
    }

    pub(crate) fn clear(&self) {
        self.inner.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::ValueCache;
    use crate::config::CacheConfig;

    #[test]
    fn disabled_unless_enabled_with_room() {
        assert!(ValueCache::<u32, u32>::from_config(&CacheConfig::default()).is_none());
        assert!(ValueCache::<u32, u32>::from_config(&CacheConfig { enabled: true, limit: 0 }).is_none());
        assert!(ValueCache::<u32, u32>::from_config(&CacheConfig { enabled: true, limit: 8 }).is_some());
    }

    #[test]
    fn insert_and_forget() {
        let Some(cache) = ValueCache::<u32, &'static str>::from_config(&CacheConfig { enabled: true, limit: 8 }) else {
            unreachable!()
        };
        cache.insert(1, "one");
        cache.insert(2, "two");
        assert_eq!(cache.get(&1), Some("one"));

        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("two"));
    }
}
