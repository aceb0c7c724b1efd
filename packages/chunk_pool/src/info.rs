use std::ptr::NonNull;
use std::thread::ThreadId;

use crate::{Chunk, ChunkState};

/// Snapshot of one chunk, returned by [`ChunkPool::get_chunk()`][crate::ChunkPool::get_chunk].
///
/// The snapshot is a copy taken under the pool lock. It does not change when the chunk does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkInfo {
    index: usize,
    address: NonNull<u8>,
    state: ChunkState,
    guard_intact: bool,
    was_corrupted: bool,
    owner: Option<ThreadId>,
}

impl ChunkInfo {
    pub(crate) fn capture(index: usize, chunk: &Chunk) -> Self {
        Self {
            index,
            address: chunk.ptr(),
            state: chunk.state(),
            guard_intact: chunk.guard().is_intact(),
            was_corrupted: chunk.was_corrupted(),
            owner: chunk.owner(),
        }
    }

    /// Position of the chunk in the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the block the chunk manages.
    #[must_use]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// State of the chunk when the snapshot was taken.
    #[must_use]
    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Whether the guard bytes currently hold their expected values.
    ///
    /// A chunk quarantined under [`CorruptionPolicy::Reject`][crate::CorruptionPolicy::Reject]
    /// keeps its damaged guard until it is unblocked.
    #[must_use]
    pub fn guard_intact(&self) -> bool {
        self.guard_intact
    }

    /// Whether any release of this chunk has ever found its guard bytes damaged.
    ///
    /// The flag is sticky: healing the guard does not clear it.
    #[must_use]
    pub fn was_corrupted(&self) -> bool {
        self.was_corrupted
    }

    /// The only thread allowed to free the block, for blocks handed out by
    /// [`ChunkPool::allocate_owned()`][crate::ChunkPool::allocate_owned].
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }
}

// SAFETY: The address is informational. The snapshot grants no access to the memory behind it.
unsafe impl Send for ChunkInfo {}

// SAFETY: See above.
unsafe impl Sync for ChunkInfo {}

/// Consistent snapshot of the pool's counters, taken under a single lock acquisition.
///
/// Returned by [`ChunkPool::stats()`][crate::ChunkPool::stats].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub(crate) item_size: usize,
    pub(crate) chunk_count: usize,
    pub(crate) used: usize,
    pub(crate) free: usize,
    pub(crate) blocked: usize,
    pub(crate) corrupted: usize,
}

impl PoolStats {
    /// Padded size of every block in bytes.
    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Number of chunks in the pool, in every state.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Number of chunks held by callers.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of chunks available to the next allocations.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free
    }

    /// Number of chunks taken out of circulation.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.blocked
    }

    /// Number of chunks whose guard bytes have been found damaged at least once.
    #[must_use]
    pub fn corrupted(&self) -> usize {
        self.corrupted
    }

    /// Bytes available to the next allocations.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        // Cannot overflow because the same product was allocated when the chunks were added.
        self.free.wrapping_mul(self.item_size)
    }

    /// Bytes held by callers.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        // Cannot overflow because the same product was allocated when the chunks were added.
        self.used.wrapping_mul(self.item_size)
    }

    /// Total bytes the pool manages, in every state.
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        // Cannot overflow because the same product was allocated when the chunks were added.
        self.chunk_count.wrapping_mul(self.item_size)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ChunkInfo: Send, Sync, Copy);
    assert_impl_all!(PoolStats: Send, Sync, Copy);

    #[test]
    fn capture_copies_chunk_fields() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(NonNull::new(storage.as_mut_ptr()).unwrap());
        chunk.mark_used(None);

        let info = ChunkInfo::capture(5, &chunk);

        assert_eq!(info.index(), 5);
        assert_eq!(info.address().as_ptr(), storage.as_mut_ptr());
        assert_eq!(info.state(), ChunkState::Used);
        assert!(info.guard_intact());
        assert!(!info.was_corrupted());
        assert_eq!(info.owner(), None);
    }

    #[test]
    fn capture_copies_owner() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(NonNull::new(storage.as_mut_ptr()).unwrap());
        let me = std::thread::current().id();
        chunk.mark_used(Some(me));

        let info = ChunkInfo::capture(0, &chunk);

        assert_eq!(info.owner(), Some(me));
    }

    #[test]
    fn byte_counters_scale_with_item_size() {
        let stats = PoolStats {
            item_size: 32,
            chunk_count: 10,
            used: 3,
            free: 6,
            blocked: 1,
            corrupted: 0,
        };

        assert_eq!(stats.free_bytes(), 192);
        assert_eq!(stats.used_bytes(), 96);
        assert_eq!(stats.capacity_bytes(), 320);
    }
}
