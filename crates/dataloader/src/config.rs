//! Settings the embedding engine exposes for batched loading.

use std::{num::NonZeroUsize, time::Duration};

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataLoaderConfig {
    /// Upper bound on the number of keys sent to the loader in one call. A larger batch window is
    /// split into several concurrent calls. Unbounded by default.
    pub max_batch_size: Option<NonZeroUsize>,
    pub cache: CacheConfig,
}

impl DataLoaderConfig {
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = NonZeroUsize::new(max_batch_size);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, limit: u64) -> Self {
        self.cache = CacheConfig { enabled: true, limit };
        self
    }
}

/// Reuse of values resolved by an earlier batch window within one execution.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// The maximum number of values that can be kept in the cache.
    /// 256 by default.
    pub limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Cancels the execution once elapsed. No limit by default.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout: Option<Duration>,
}
