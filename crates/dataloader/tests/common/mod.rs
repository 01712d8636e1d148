#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use dataloader::{BatchResult, Loader};
use parking_lot::Mutex;

#[ctor::ctor]
fn setup_logging() {
    let filter = tracing_subscriber::filter::EnvFilter::builder()
        .parse(std::env::var("RUST_LOG").unwrap_or_else(|_| "dataloader=debug".to_string()))
        .unwrap();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .without_time()
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u32);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepositoryError {
    #[error("missing")]
    Missing,
    #[error("storage unreachable")]
    Unreachable,
}

/// In-memory stand-in for a document store holding link descriptions. Records every batch it
/// receives.
#[derive(Default)]
pub struct LinkRepository {
    descriptions: HashMap<LinkId, String>,
    calls: Mutex<Vec<Vec<LinkId>>>,
    unreachable: bool,
}

impl LinkRepository {
    pub fn with_links(count: u32) -> Arc<Self> {
        Arc::new(LinkRepository {
            descriptions: (1..=count)
                .map(|id| (LinkId(id), format!("description of link {id}")))
                .collect(),
            ..Default::default()
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(LinkRepository {
            unreachable: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Vec<LinkId>> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl Loader<LinkId> for LinkRepository {
    type Value = String;
    type Error = RepositoryError;

    async fn load(&self, keys: &[LinkId]) -> BatchResult<String, RepositoryError> {
        self.calls.lock().push(keys.to_vec());
        if self.unreachable {
            return Err(RepositoryError::Unreachable);
        }

        Ok(keys
            .iter()
            .map(|id| self.descriptions.get(id).cloned().ok_or(RepositoryError::Missing))
            .collect())
    }
}

/// Returns a fixed number of results, whatever it is asked for.
pub struct Truncating {
    pub results: usize,
}

#[async_trait::async_trait]
impl Loader<LinkId> for Truncating {
    type Value = String;
    type Error = RepositoryError;

    async fn load(&self, _keys: &[LinkId]) -> BatchResult<String, RepositoryError> {
        Ok((0..self.results).map(|i| Ok(i.to_string())).collect())
    }
}
