use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use new_zealand::nz;

use crate::{
    BulkAllocator, ChunkPool, Clock, CorruptionPolicy, DropPolicy, MonotonicClock, SystemAllocator,
};

/// Number of blocks a pool obtains in [`create()`][ChunkPool::create] unless told otherwise.
pub(crate) const DEFAULT_ELEMENT_COUNT: NonZero<usize> = nz!(16);

/// Alignment requested unless told otherwise. It is raised to pointer size when the pool is
/// created, so this effectively means "pointer-aligned".
pub(crate) const DEFAULT_ALIGNMENT: usize = 1;

/// Builder for creating an instance of [`ChunkPool`].
///
/// The item size is mandatory, whereas other settings are optional. Size and alignment are only
/// validated when [`ChunkPool::create()`] is called, so building never fails.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use chunk_pool::{ChunkPool, DropPolicy};
/// use new_zealand::nz;
///
/// let pool = ChunkPool::builder()
///     .item_size(100)
///     .element_count(nz!(32))
///     .alignment(16)
///     .drop_policy(DropPolicy::MustNotDropUsedBlocks)
///     .build();
///
/// pool.create(Duration::from_secs(1)).unwrap();
///
/// // 100 bytes padded to a multiple of 16.
/// assert_eq!(pool.item_size(), Some(112));
/// assert_eq!(pool.chunk_count(), 32);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be transferred between threads, so a pool can
/// be configured on a different thread than where it is used. It is not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct ChunkPoolBuilder<A = SystemAllocator, C = MonotonicClock> {
    item_size: Option<usize>,
    element_count: NonZero<usize>,
    alignment: usize,
    corruption_policy: CorruptionPolicy,
    drop_policy: DropPolicy,
    allocator: A,
    clock: C,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl ChunkPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            item_size: None,
            element_count: DEFAULT_ELEMENT_COUNT,
            alignment: DEFAULT_ALIGNMENT,
            corruption_policy: CorruptionPolicy::default(),
            drop_policy: DropPolicy::default(),
            allocator: SystemAllocator,
            clock: MonotonicClock,
            _not_sync: PhantomData,
        }
    }
}

impl<A, C> ChunkPoolBuilder<A, C>
where
    A: BulkAllocator,
    C: Clock,
{
    /// Sets the size in bytes of every block. It is padded to the alignment when the pool is
    /// created.
    #[inline]
    pub fn item_size(mut self, item_size: usize) -> Self {
        self.item_size = Some(item_size);
        self
    }

    /// Sets how many blocks the pool obtains when it is created.
    ///
    /// More blocks can be added later with [`ChunkPool::add_memory()`] and
    /// [`ChunkPool::add_memory_from()`].
    #[inline]
    pub fn element_count(mut self, element_count: NonZero<usize>) -> Self {
        self.element_count = element_count;
        self
    }

    /// Sets the alignment of every block. It must be a power of two and is raised to pointer size
    /// if smaller.
    #[inline]
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the [corruption policy][CorruptionPolicy], which governs what a release does when it
    /// finds damaged guard bytes.
    #[inline]
    pub fn corruption_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.corruption_policy = policy;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how to treat blocks that are
    /// still in use when the pool is dropped.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Replaces the allocator that provides the backing storage for growth.
    #[inline]
    pub fn allocator<A2: BulkAllocator>(self, allocator: A2) -> ChunkPoolBuilder<A2, C> {
        ChunkPoolBuilder {
            item_size: self.item_size,
            element_count: self.element_count,
            alignment: self.alignment,
            corruption_policy: self.corruption_policy,
            drop_policy: self.drop_policy,
            allocator,
            clock: self.clock,
            _not_sync: PhantomData,
        }
    }

    /// Replaces the clock that timeouts are measured against.
    #[inline]
    pub fn clock<C2: Clock>(self, clock: C2) -> ChunkPoolBuilder<A, C2> {
        ChunkPoolBuilder {
            item_size: self.item_size,
            element_count: self.element_count,
            alignment: self.alignment,
            corruption_policy: self.corruption_policy,
            drop_policy: self.drop_policy,
            allocator: self.allocator,
            clock,
            _not_sync: PhantomData,
        }
    }

    /// Builds the pool with the specified configuration.
    ///
    /// The pool holds no memory until [`ChunkPool::create()`] is called.
    ///
    /// # Panics
    ///
    /// Panics if no item size has been set using [`item_size`](Self::item_size).
    #[must_use]
    #[inline]
    pub fn build(self) -> ChunkPool<A, C> {
        let item_size = self
            .item_size
            .expect("item size must be set using .item_size() before calling .build()");

        ChunkPool::new_inner(
            item_size,
            Some(self.element_count),
            self.alignment,
            self.corruption_policy,
            self.drop_policy,
            self.allocator,
            self.clock,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ChunkPoolBuilder: Send, Debug);
    assert_not_impl_any!(ChunkPoolBuilder: Sync);

    #[test]
    fn new_has_defaults() {
        let builder = ChunkPoolBuilder::new();

        assert!(builder.item_size.is_none());
        assert_eq!(builder.element_count, DEFAULT_ELEMENT_COUNT);
        assert_eq!(builder.element_count.get(), 16);
        assert_eq!(builder.alignment, DEFAULT_ALIGNMENT);
        assert_eq!(builder.corruption_policy, CorruptionPolicy::Heal);
        assert_eq!(builder.drop_policy, DropPolicy::MayDropUsedBlocks);
    }

    #[test]
    fn setters_are_recorded() {
        let builder = ChunkPoolBuilder::new()
            .item_size(48)
            .element_count(nz!(3))
            .alignment(32)
            .corruption_policy(CorruptionPolicy::Reject)
            .drop_policy(DropPolicy::MustNotDropUsedBlocks);

        assert_eq!(builder.item_size, Some(48));
        assert_eq!(builder.element_count.get(), 3);
        assert_eq!(builder.alignment, 32);
        assert_eq!(builder.corruption_policy, CorruptionPolicy::Reject);
        assert_eq!(builder.drop_policy, DropPolicy::MustNotDropUsedBlocks);
    }

    #[test]
    fn replacing_collaborators_keeps_settings() {
        let builder = ChunkPoolBuilder::new()
            .item_size(8)
            .element_count(nz!(2))
            .allocator(SystemAllocator)
            .clock(MonotonicClock);

        assert_eq!(builder.item_size, Some(8));
        assert_eq!(builder.element_count.get(), 2);
    }

    #[test]
    fn build_does_not_create() {
        let pool = ChunkPoolBuilder::new().item_size(8).build();

        assert!(!pool.is_created());
        assert_eq!(pool.chunk_count(), 0);
    }

    #[test]
    fn built_pool_creates_requested_element_count() {
        let pool = ChunkPoolBuilder::new()
            .item_size(8)
            .element_count(nz!(5))
            .build();

        pool.create(std::time::Duration::from_secs(1)).unwrap();

        assert_eq!(pool.chunk_count(), 5);
    }

    #[test]
    #[should_panic]
    fn build_without_item_size_panics() {
        let _pool = ChunkPoolBuilder::new().build();
    }
}
