pub mod fixture;
pub mod gpu;
pub mod process;

use crate::error::CollectError;
use crate::metrics::Collection;

pub use fixture::FixtureCollector;
pub use gpu::NvmlCollector;

/// Source of raw device and process readings.
///
/// Implementations block; async callers should run them on a blocking thread.
pub trait Collector: Send + Sync {
    fn collect(&self) -> Result<Collection, CollectError>;
}
