//! Tunable knobs for a [`crate::index::ValueIndex`].
//!
//! This crate does not read these from a file itself (the embedding
//! application owns that, the way `kimberlite-storage` callers own their
//! own `CheckpointPolicy`); `IndexConfig` only derives `serde` so an
//! application config layer can embed it as a field.

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::index::ValueIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum number of keys held in the in-memory lookup cache before the
    /// oldest entry is evicted.
    pub cache_capacity: usize,

    /// Advisory threshold for [`crate::index::ValueIndex::needs_rebuild`]:
    /// once the ratio of dead (overwritten-by-append) bytes in the heap
    /// file crosses this fraction, the caller should consider rebuilding
    /// the index from scratch. This crate never rebuilds on its own.
    pub rebuild_dead_ratio: f64,

    /// Whether mutating operations poll the caller-supplied interrupt
    /// closure between whole-key iterations.
    pub cooperative_interrupts: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            rebuild_dead_ratio: 0.5,
            cooperative_interrupts: true,
        }
    }
}

impl IndexConfig {
    /// Configuration with interrupt polling disabled, useful for tests and
    /// for callers that never invoke the batch operations from a cancellable
    /// job context.
    #[must_use]
    pub fn without_interrupts() -> Self {
        Self {
            cooperative_interrupts: false,
            ..Self::default()
        }
    }
}
