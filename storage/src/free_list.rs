//! FreeList module — hands out block ids that have never been used.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::serializer::{BlockId, Serializer};

/// Monotonic block id allocator, seeded from the store's block count at open
/// so no persisted block is ever handed out as fresh.
pub struct FreeList {
    next_block_id: AtomicU64,
}

impl FreeList {
    /// Creates a free list for the store behind `serializer`.
    pub fn new(serializer: &Serializer) -> FreeList {
        FreeList {
            next_block_id: AtomicU64::new(serializer.block_count()),
        }
    }

    /// Returns a block id no earlier call has returned.
    pub fn acquire_block_id(&self) -> BlockId {
        self.next_block_id.fetch_add(1, Ordering::Relaxed)
    }
}
