/// Determines what a release does when it finds the guard bytes of a chunk damaged.
///
/// Either way the damage is recorded on the chunk (see [`ChunkInfo::was_corrupted`]) and reported
/// through a `tracing` warning.
///
/// # Examples
///
/// ```
/// use chunk_pool::{ChunkPool, CorruptionPolicy};
/// use new_zealand::nz;
///
/// let pool = ChunkPool::builder()
///     .item_size(32)
///     .element_count(nz!(8))
///     .corruption_policy(CorruptionPolicy::Reject)
///     .build();
/// ```
///
/// [`ChunkInfo::was_corrupted`]: crate::ChunkInfo::was_corrupted
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum CorruptionPolicy {
    /// Repair the guard bytes and return the chunk to circulation. The release succeeds and
    /// reports [`FreeStatus::CorruptionHealed`][crate::FreeStatus::CorruptionHealed]. This is
    /// the default.
    #[default]
    Heal,

    /// Quarantine the chunk as [`Blocked`][crate::ChunkState::Blocked] and fail the release with
    /// [`Error::Corrupted`][crate::Error::Corrupted].
    ///
    /// The chunk stays out of circulation until an operator unblocks it with
    /// [`ChunkPool::set_blocked()`][crate::ChunkPool::set_blocked], which also repairs the guard.
    Reject,
}

/// Determines behavior when the pool is dropped while some of its blocks are still in use.
///
/// Dropping the pool always releases the memory it obtained from its bulk allocator, so any
/// handle still in use afterwards points to freed memory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool releases its memory even if blocks are still in use. This is the default.
    #[default]
    MayDropUsedBlocks,

    /// The pool panics if it still has blocks in use when it is dropped.
    ///
    /// Useful when the app promises to return every block before tearing the pool down and
    /// wants a loud failure when that promise is broken.
    MustNotDropUsedBlocks,
}
