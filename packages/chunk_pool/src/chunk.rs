use std::ptr::{self, NonNull};
use std::thread::ThreadId;

use crate::{ChunkGuard, CorruptionPolicy};

/// Lifecycle state of a single chunk in a [`ChunkPool`][crate::ChunkPool].
///
/// The three states are mutually exclusive. Chunks start out [`Free`][ChunkState::Free], become
/// [`Used`][ChunkState::Used] when handed out by an allocation and return to `Free` when released.
/// [`Blocked`][ChunkState::Blocked] is an administrative quarantine that takes a chunk out of
/// circulation without anyone holding it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ChunkState {
    /// The chunk can be handed out by the next allocation.
    Free,

    /// The chunk is held by a caller.
    Used,

    /// The chunk is quarantined and is skipped by allocations.
    Blocked,
}

/// What a release of a chunk observed about its guard bytes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum FreeStatus {
    /// The guard bytes were intact.
    Clean,

    /// The guard bytes were damaged. The chunk was repaired and returned to circulation.
    CorruptionHealed,
}

impl FreeStatus {
    /// Whether the release detected damaged guard bytes.
    #[must_use]
    pub fn was_corrupted(self) -> bool {
        matches!(self, Self::CorruptionHealed)
    }
}

/// Outcome of [`Chunk::release`] that the pool turns into its public result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Release {
    Clean,
    Healed,
    Quarantined,
}

/// Bookkeeping record for one fixed-size block.
///
/// The record never owns the block memory. The pool owns it through its regions (or the caller
/// does, for adopted buffers) and the record only remembers where the block is.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Chunk {
    ptr: NonNull<u8>,
    guard: ChunkGuard,
    state: ChunkState,
    was_corrupted: bool,
    owner: Option<ThreadId>,
}

impl Chunk {
    /// Creates a free chunk with an intact guard for the block at `ptr`.
    #[must_use]
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self {
            ptr,
            guard: ChunkGuard::intact(),
            state: ChunkState::Free,
            was_corrupted: false,
            owner: None,
        }
    }

    #[must_use]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub(crate) fn state(&self) -> ChunkState {
        self.state
    }

    #[must_use]
    pub(crate) fn guard(&self) -> ChunkGuard {
        self.guard
    }

    #[must_use]
    pub(crate) fn was_corrupted(&self) -> bool {
        self.was_corrupted
    }

    /// The thread that must release the chunk, if it was handed out as owner-only.
    #[must_use]
    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Whether `thread` is allowed to release the chunk.
    #[must_use]
    pub(crate) fn may_release(&self, thread: ThreadId) -> bool {
        self.owner.is_none_or(|owner| owner == thread)
    }

    /// Hands the chunk out, optionally restricting its release to the `owner` thread.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is not free. The pool only calls this after finding a free chunk
    /// while holding its lock, so a failure here means the bookkeeping is broken.
    pub(crate) fn mark_used(&mut self, owner: Option<ThreadId>) {
        assert_eq!(
            self.state,
            ChunkState::Free,
            "attempted to hand out chunk at {:p} which is not free",
            self.ptr
        );

        self.state = ChunkState::Used;
        self.owner = owner;
    }

    /// Moves a chunk that nobody holds between `Free` and `Blocked`.
    ///
    /// Returns `false` without changing anything if the chunk is currently used.
    #[must_use]
    pub(crate) fn set_blocked(&mut self, blocked: bool) -> bool {
        if self.state == ChunkState::Used {
            return false;
        }

        if !blocked {
            // A chunk quarantined for corruption comes back with a working guard.
            self.guard.restore();
        }

        self.state = if blocked {
            ChunkState::Blocked
        } else {
            ChunkState::Free
        };

        true
    }

    /// Takes a used chunk back, checking its guard and wiping the block.
    ///
    /// # Safety
    ///
    /// The chunk must be `Used`, and the block must consist of `item_size` bytes that are valid
    /// for writes. The caller that held the chunk must no longer access the block.
    pub(crate) unsafe fn release(&mut self, item_size: usize, policy: CorruptionPolicy) -> Release {
        debug_assert_eq!(self.state, ChunkState::Used);

        // SAFETY: Forwarding the guarantee from our caller that the block is `item_size` writable
        // bytes that nobody else is accessing any more.
        unsafe {
            ptr::write_bytes(self.ptr.as_ptr(), 0, item_size);
        }

        self.owner = None;

        if self.guard.is_intact() {
            self.state = ChunkState::Free;
            return Release::Clean;
        }

        self.was_corrupted = true;

        match policy {
            CorruptionPolicy::Heal => {
                self.guard.restore();
                self.state = ChunkState::Free;
                Release::Healed
            }
            CorruptionPolicy::Reject => {
                self.state = ChunkState::Blocked;
                Release::Quarantined
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn guard_mut(&mut self) -> &mut ChunkGuard {
        &mut self.guard
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;

    fn block(storage: &mut [u8; 8]) -> NonNull<u8> {
        NonNull::new(storage.as_mut_ptr()).unwrap()
    }

    #[test]
    fn new_chunk_is_free_and_healthy() {
        let mut storage = [0_u8; 8];
        let chunk = Chunk::new(block(&mut storage));

        assert_eq!(chunk.state(), ChunkState::Free);
        assert!(chunk.guard().is_intact());
        assert!(!chunk.was_corrupted());
        assert_eq!(chunk.ptr().as_ptr(), storage.as_mut_ptr());
    }

    #[test]
    fn release_zeroes_block() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));
        chunk.mark_used(None);

        unsafe {
            ptr::write_bytes(chunk.ptr().as_ptr(), 0xee, 8);
        }

        let outcome = unsafe { chunk.release(8, CorruptionPolicy::Heal) };

        assert_eq!(outcome, Release::Clean);
        assert_eq!(chunk.state(), ChunkState::Free);
        assert_eq!(storage, [0; 8]);
    }

    #[test]
    fn release_heals_damaged_guard() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));
        chunk.mark_used(None);
        chunk.guard_mut().overwrite([0, 0]);

        let outcome = unsafe { chunk.release(8, CorruptionPolicy::Heal) };

        assert_eq!(outcome, Release::Healed);
        assert_eq!(chunk.state(), ChunkState::Free);
        assert!(chunk.guard().is_intact());
        assert!(chunk.was_corrupted());
    }

    #[test]
    fn release_quarantines_damaged_guard_when_rejecting() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));
        chunk.mark_used(None);
        chunk.guard_mut().overwrite([0, 0]);

        let outcome = unsafe { chunk.release(8, CorruptionPolicy::Reject) };

        assert_eq!(outcome, Release::Quarantined);
        assert_eq!(chunk.state(), ChunkState::Blocked);
        assert!(!chunk.guard().is_intact());
        assert!(chunk.was_corrupted());

        // Unblocking puts it back into circulation with a repaired guard.
        assert!(chunk.set_blocked(false));
        assert_eq!(chunk.state(), ChunkState::Free);
        assert!(chunk.guard().is_intact());
    }

    #[test]
    fn corruption_flag_is_sticky() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));

        chunk.mark_used(None);
        chunk.guard_mut().overwrite([9, 9]);
        _ = unsafe { chunk.release(8, CorruptionPolicy::Heal) };

        chunk.mark_used(None);
        let outcome = unsafe { chunk.release(8, CorruptionPolicy::Heal) };

        assert_eq!(outcome, Release::Clean);
        assert!(chunk.was_corrupted());
    }

    #[test]
    fn used_chunk_cannot_be_blocked() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));
        chunk.mark_used(None);

        assert!(!chunk.set_blocked(true));
        assert!(!chunk.set_blocked(false));
        assert_eq!(chunk.state(), ChunkState::Used);
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));

        assert!(chunk.set_blocked(true));
        assert_eq!(chunk.state(), ChunkState::Blocked);

        // Blocking twice is harmless.
        assert!(chunk.set_blocked(true));
        assert_eq!(chunk.state(), ChunkState::Blocked);

        assert!(chunk.set_blocked(false));
        assert_eq!(chunk.state(), ChunkState::Free);
    }

    #[test]
    #[should_panic]
    fn mark_used_twice_panics() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));

        chunk.mark_used(None);
        chunk.mark_used(None);
    }

    #[test]
    fn owner_only_chunk_admits_only_its_owner() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));
        let me = std::thread::current().id();
        let other = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();

        chunk.mark_used(Some(me));

        assert_eq!(chunk.owner(), Some(me));
        assert!(chunk.may_release(me));
        assert!(!chunk.may_release(other));

        _ = unsafe { chunk.release(8, CorruptionPolicy::Heal) };

        assert_eq!(chunk.owner(), None);
        assert!(chunk.may_release(other));
    }

    #[test]
    fn shared_chunk_admits_any_thread() {
        let mut storage = [0_u8; 8];
        let mut chunk = Chunk::new(block(&mut storage));
        let other = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();

        chunk.mark_used(None);

        assert_eq!(chunk.owner(), None);
        assert!(chunk.may_release(other));
    }

    #[test]
    fn free_status_reports_corruption() {
        assert!(!FreeStatus::Clean.was_corrupted());
        assert!(FreeStatus::CorruptionHealed.was_corrupted());
    }
}
