use std::{fmt, sync::Arc, time::Duration};

/// Why a [`PendingValue`](crate::PendingValue) failed.
///
/// Failures stay local to the value they are delivered to: siblings loaded in the same batch are
/// not affected by a `KeyFetchFailed`.
#[derive(Debug, thiserror::Error)]
pub enum LoadError<K: fmt::Debug, E: std::error::Error + 'static> {
    #[error("Failed to load {key:?}: {cause}")]
    KeyFetchFailed {
        key: K,
        #[source]
        cause: Arc<E>,
    },
    #[error("Batch loader returned {actual} results for {expected} keys")]
    BatchContractViolation { expected: usize, actual: usize },
    #[error("Batch loader unavailable: {0}")]
    BatchLoaderUnavailable(#[source] Arc<E>),
    #[error("Resolution was cancelled")]
    Cancelled,
}

impl<K: fmt::Debug, E: std::error::Error + 'static> LoadError<K, E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }

    /// The error reported by the loader, if there was one.
    pub fn loader_error(&self) -> Option<&E> {
        match self {
            LoadError::KeyFetchFailed { cause, .. } | LoadError::BatchLoaderUnavailable(cause) => Some(cause.as_ref()),
            LoadError::BatchContractViolation { .. } | LoadError::Cancelled => None,
        }
    }
}

// Derive would require `E: Clone`, causes are shared instead.
impl<K: fmt::Debug + Clone, E: std::error::Error + 'static> Clone for LoadError<K, E> {
    fn clone(&self) -> Self {
        match self {
            LoadError::KeyFetchFailed { key, cause } => LoadError::KeyFetchFailed {
                key: key.clone(),
                cause: Arc::clone(cause),
            },
            LoadError::BatchContractViolation { expected, actual } => LoadError::BatchContractViolation {
                expected: *expected,
                actual: *actual,
            },
            LoadError::BatchLoaderUnavailable(cause) => LoadError::BatchLoaderUnavailable(Arc::clone(cause)),
            LoadError::Cancelled => LoadError::Cancelled,
        }
    }
}

/// Stops a whole execution of the [`ResolutionScheduler`](crate::ResolutionScheduler).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution was cancelled")]
    Cancelled,
    #[error("Execution timed out after {0:?}")]
    TimedOut(Duration),
}
