use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::Collector;
use crate::error::CollectError;
use crate::metrics::Collection;

/// Replays a collection stored as JSON. The file is re-read on every call.
pub struct FixtureCollector {
    path: PathBuf,
}

impl FixtureCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Collector for FixtureCollector {
    fn collect(&self) -> Result<Collection, CollectError> {
        debug!(path = %self.path.display(), "reading fixture");
        let data = fs::read_to_string(&self.path).map_err(|source| CollectError::Fixture {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| CollectError::FixtureFormat {
            path: self.path.clone(),
            source,
        })
    }
}
