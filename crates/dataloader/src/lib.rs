//! Batched field resolution.
//!
//! Resolvers call [`Dispatcher::load`] for every object they need and immediately get a
//! [`PendingValue`] back. The [`ResolutionScheduler`] drives all resolvers of an execution until
//! none of them can make progress, then flushes every dispatcher with queued keys: each one calls
//! its [`Loader`] once with the deduplicated keys of the batch window and hands the individual
//! results back to the waiting resolvers. N sibling objects asking for the same kind of data thus
//! cost one fetch instead of N.
#![cfg_attr(test, allow(unused_crate_dependencies))]

mod cache;
pub mod config;
mod dispatcher;
mod error;
mod loader;
mod pending;
mod scheduler;

pub use config::{CacheConfig, DataLoaderConfig, SchedulerConfig};
pub use dispatcher::Dispatcher;
pub use error::{ExecutionError, LoadError};
pub use loader::{BatchResult, Key, Loader};
pub use pending::{PendingState, PendingValue};
pub use scheduler::{BatchSource, ResolutionScheduler};

/// Value handed out by [`Dispatcher::load`] for a given loader.
pub type PendingLoad<K, L> = PendingValue<<L as Loader<K>>::Value, LoadError<K, <L as Loader<K>>::Error>>;
