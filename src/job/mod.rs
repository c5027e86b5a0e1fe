//! Bulk dispatch job engine.
//!
//! The orchestrator splits an input row source into fixed-size chunks and
//! spawns one batch worker task per chunk plus a polling finalizer. Workers
//! share nothing but the job row's counters, which they bump through atomic
//! increments, so chunk completion order never matters.

pub mod finalizer;
pub mod orchestrator;
pub mod worker;

use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::config::DispatchConfig;
use crate::store::Store;
use crate::transport::Transport;

/// Shared dependencies for the orchestrator, batch workers, and finalizer.
pub struct JobEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) config: DispatchConfig,
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        artifacts: Arc<dyn ArtifactStore>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            artifacts,
            config,
        })
    }
}

/// Partition `[0, total)` into contiguous half-open chunks of `chunk_size`.
///
/// The ranges cover the interval exactly: no gaps, no overlaps, last chunk
/// short when `total` isn't a multiple of the size.
pub fn chunk_ranges(total: usize, chunk_size: usize) -> Vec<(usize, usize)> {
    assert!(chunk_size >= 1, "chunk size must be at least 1");
    let mut ranges = Vec::with_capacity(total.div_ceil(chunk_size));
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        ranges.push((start, end));
        start = end;
    }
    ranges
}
