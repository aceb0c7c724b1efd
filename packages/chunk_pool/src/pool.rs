use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    BlockHandle, BlockLayout, BulkAllocator, Chunk, ChunkInfo, ChunkPoolBuilder, ChunkState, ChunkTable,
    Clock, CorruptionPolicy, Deadline, DropPolicy, Error, FreeStatus, MonotonicClock, OwnedRegion,
    PoolStats, Release, Remaining, Result, SystemAllocator,
};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique pool ID.
fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A thread-safe pool of fixed-size memory blocks.
///
/// The pool hands out blocks of one size, chosen when the pool is constructed and padded to the
/// pool's alignment. Blocks come from regions obtained in bulk, either from a [`BulkAllocator`] or
/// from buffers the caller donates. Blocks are recycled but never returned to the allocator until
/// the pool itself is dropped.
///
/// # Lifecycle
///
/// 1. Construct with [`ChunkPool::new()`] or [`ChunkPool::builder()`]. This holds no memory yet.
/// 2. Call [`create()`][Self::create] to validate the configuration and obtain the first batch of
///    blocks.
/// 3. [`allocate()`][Self::allocate] and [`free()`][Self::free] blocks from any number of threads.
///    Grow with [`add_memory()`][Self::add_memory] or [`add_memory_from()`][Self::add_memory_from]
///    when needed.
///
/// # Timeouts
///
/// Every operation that may block takes a [`Duration`] budget. The budget covers acquiring the
/// pool lock and any waiting for a block to become free, together. A zero budget still makes one
/// attempt. [`Duration::MAX`] waits forever.
///
/// # Corruption guards
///
/// Every chunk carries two sentinel bytes next to its bookkeeping. A release that finds them
/// damaged logs a warning, marks the chunk as having been corrupted and then acts according to
/// the pool's [`CorruptionPolicy`].
///
/// # Free blocks are zeroed
///
/// Every block that is handed out by [`allocate()`][Self::allocate] contains only zero bytes.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use chunk_pool::ChunkPool;
///
/// const TIMEOUT: Duration = Duration::from_millis(100);
///
/// let pool = ChunkPool::new(16, 2, 8);
/// pool.create(TIMEOUT).unwrap();
///
/// let a = pool.allocate(TIMEOUT).unwrap();
/// let b = pool.allocate(TIMEOUT).unwrap();
///
/// // Both blocks are taken, so this waits for the timeout and gives up.
/// assert!(pool.allocate(Duration::ZERO).is_none());
///
/// pool.free(a, TIMEOUT).unwrap();
/// pool.free(b, TIMEOUT).unwrap();
/// assert_eq!(pool.get_free(), 2);
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]) and is typically shared through a reference or
/// an [`Arc`][std::sync::Arc]. All bookkeeping is guarded by one lock.
#[derive(Debug)]
pub struct ChunkPool<A: BulkAllocator = SystemAllocator, C: Clock = MonotonicClock> {
    pool_id: u64,

    requested_item_size: usize,
    requested_alignment: usize,

    // `None` when the pool was constructed with zero blocks, which `create()` rejects.
    element_count: Option<NonZero<usize>>,

    corruption_policy: CorruptionPolicy,
    drop_policy: DropPolicy,

    allocator: A,
    clock: C,

    // Set exactly once, by the first successful `create()`, while holding the state lock.
    // Operations check this without locking to fail fast on a pool that is not created.
    layout: OnceLock<BlockLayout>,

    state: Mutex<PoolState>,

    // Signaled whenever a chunk leaves `Used` or a free chunk may have appeared.
    chunk_freed: Condvar,
}

#[derive(Debug)]
struct PoolState {
    chunks: ChunkTable,

    // Regions obtained from the bulk allocator, to be given back when the pool is dropped.
    // Adopted caller buffers are not listed here.
    regions: Vec<OwnedRegion>,
}

// SAFETY: The state holds raw pointers to pool-owned (or adopted, exclusively donated) memory.
// None of it is tied to a particular thread and all access goes through the mutex.
unsafe impl Send for PoolState {}

impl ChunkPool {
    /// Creates a pool with the default allocator, clock and policies.
    ///
    /// No memory is obtained and nothing is validated until [`create()`][Self::create].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use chunk_pool::ChunkPool;
    ///
    /// let pool = ChunkPool::new(24, 10, 8);
    /// pool.create(Duration::from_secs(1)).unwrap();
    ///
    /// assert_eq!(pool.size(), 240);
    /// ```
    #[must_use]
    pub fn new(item_size: usize, element_count: usize, alignment: usize) -> Self {
        Self::new_inner(
            item_size,
            NonZero::new(element_count),
            alignment,
            CorruptionPolicy::default(),
            DropPolicy::default(),
            SystemAllocator,
            MonotonicClock,
        )
    }

    /// Creates a builder for configuring and constructing a [`ChunkPool`].
    #[inline]
    pub fn builder() -> ChunkPoolBuilder {
        ChunkPoolBuilder::new()
    }
}

impl<A: BulkAllocator, C: Clock> ChunkPool<A, C> {
    pub(crate) fn new_inner(
        item_size: usize,
        element_count: Option<NonZero<usize>>,
        alignment: usize,
        corruption_policy: CorruptionPolicy,
        drop_policy: DropPolicy,
        allocator: A,
        clock: C,
    ) -> Self {
        Self {
            pool_id: generate_pool_id(),
            requested_item_size: item_size,
            requested_alignment: alignment,
            element_count,
            corruption_policy,
            drop_policy,
            allocator,
            clock,
            layout: OnceLock::new(),
            state: Mutex::new(PoolState {
                chunks: ChunkTable::new(),
                regions: Vec::new(),
            }),
            chunk_freed: Condvar::new(),
        }
    }

    /// Validates the configuration and obtains the initial batch of blocks.
    ///
    /// If this fails, nothing has changed and the call may be retried.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyCreated`] if an earlier call succeeded.
    /// * [`Error::InvalidAlignment`] or [`Error::InvalidItemSize`] if the configuration is invalid.
    /// * [`Error::NothingToAdd`] if the element count is zero.
    /// * [`Error::AllocationFailed`] if the bulk allocator cannot provide the memory.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    pub fn create(&self, timeout: Duration) -> Result<()> {
        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        if self.layout.get().is_some() {
            return Err(Error::AlreadyCreated);
        }

        let layout = BlockLayout::normalize(self.requested_item_size, self.requested_alignment)?;
        let element_count = self.element_count.ok_or(Error::NothingToAdd)?;

        self.grow(&mut state, layout, element_count)?;

        // Cannot already be set because we checked above while holding the same lock.
        _ = self.layout.set(layout);

        debug!(
            pool_id = self.pool_id,
            item_size = layout.item_size(),
            alignment = layout.alignment(),
            element_count = element_count.get(),
            "pool created"
        );

        Ok(())
    }

    /// Whether [`create()`][Self::create] has succeeded.
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.layout.get().is_some()
    }

    /// Takes the first free block, waiting up to `timeout` for one to become available.
    ///
    /// Returns `None` if the pool is not created, the lock could not be acquired in time or no
    /// block became free in time. Use [`try_allocate()`][Self::try_allocate] to find out which.
    #[must_use]
    pub fn allocate(&self, timeout: Duration) -> Option<BlockHandle> {
        self.try_allocate(timeout).ok()
    }

    /// Takes the first free block like [`allocate()`][Self::allocate], but only the calling
    /// thread will be able to free it.
    ///
    /// A [`free()`][Self::free] of the block from any other thread fails with
    /// [`Error::NotOwner`] and leaves the block in use.
    #[must_use]
    pub fn allocate_owned(&self, timeout: Duration) -> Option<BlockHandle> {
        self.try_allocate_owned(timeout).ok()
    }

    /// Takes the first free block, waiting up to `timeout` for one to become available.
    ///
    /// Blocks are handed out in chunk order, so the lowest-indexed free chunk is always taken
    /// first. Blocked chunks are skipped.
    ///
    /// # Errors
    ///
    /// * [`Error::NotCreated`] immediately, without waiting, if the pool is not created.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    /// * [`Error::Exhausted`] if no block became free within `timeout`.
    pub fn try_allocate(&self, timeout: Duration) -> Result<BlockHandle> {
        self.allocate_core(timeout, None)
    }

    /// Takes the first free block like [`try_allocate()`][Self::try_allocate], but only the
    /// calling thread will be able to free it.
    ///
    /// # Errors
    ///
    /// The same as [`try_allocate()`][Self::try_allocate].
    pub fn try_allocate_owned(&self, timeout: Duration) -> Result<BlockHandle> {
        self.allocate_core(timeout, Some(thread::current().id()))
    }

    fn allocate_core(&self, timeout: Duration, owner: Option<ThreadId>) -> Result<BlockHandle> {
        let layout = *self.layout.get().ok_or(Error::NotCreated)?;

        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        loop {
            if let Some((index, ptr)) = state.chunks.claim_first_free(owner) {
                trace!(
                    pool_id = self.pool_id,
                    index,
                    owned = owner.is_some(),
                    "block allocated"
                );

                return Ok(BlockHandle::new(
                    self.pool_id,
                    index,
                    ptr,
                    layout.item_size(),
                ));
            }

            if !self.wait_for_change(&mut state, &deadline) {
                return Err(Error::Exhausted { timeout });
            }
        }
    }

    /// Returns a block to the pool.
    ///
    /// The block is zeroed and becomes available to the next allocation. Its guard bytes are
    /// checked and the result reports whether they had been damaged.
    ///
    /// # Errors
    ///
    /// * [`Error::NotFound`] if the handle belongs to a different pool or its block is not in use
    ///   (for example because it was already freed). Nothing changes in this case.
    /// * [`Error::NotOwner`] if the block was allocated with
    ///   [`allocate_owned()`][Self::allocate_owned] on a different thread. Nothing changes in
    ///   this case.
    /// * [`Error::Corrupted`] if the guard bytes were damaged and the pool uses
    ///   [`CorruptionPolicy::Reject`]. The chunk is blocked.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    pub fn free(&self, handle: BlockHandle, timeout: Duration) -> Result<FreeStatus> {
        let not_found = || Error::NotFound {
            address: handle.ptr().addr().get(),
        };

        if handle.pool_id() != self.pool_id {
            return Err(not_found());
        }

        let layout = *self.layout.get().ok_or_else(not_found)?;

        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        let index = handle.index();

        // The index is a lookup hint; the address must agree with it.
        let is_in_use = state.chunks.get(index).is_some_and(|chunk| {
            chunk.ptr() == handle.ptr() && chunk.state() == ChunkState::Used
        });

        if !is_in_use {
            return Err(not_found());
        }

        self.release(&mut state, index, layout)
    }

    /// Returns a block to the pool, identified only by its address.
    ///
    /// This finds the chunk by scanning the pool, so it takes time proportional to the number of
    /// chunks. Prefer [`free()`][Self::free] when the handle is available.
    ///
    /// # Errors
    ///
    /// The same as [`free()`][Self::free].
    pub fn free_ptr(&self, ptr: NonNull<u8>, timeout: Duration) -> Result<FreeStatus> {
        let not_found = || Error::NotFound {
            address: ptr.addr().get(),
        };

        let layout = *self.layout.get().ok_or_else(not_found)?;

        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        let index = state
            .chunks
            .index_of(ptr)
            .filter(|index| {
                state
                    .chunks
                    .get(*index)
                    .is_some_and(|chunk| chunk.state() == ChunkState::Used)
            })
            .ok_or_else(not_found)?;

        self.release(&mut state, index, layout)
    }

    /// Obtains `count` more blocks from the bulk allocator.
    ///
    /// The new blocks are appended after the existing ones, so existing chunk indexes do not
    /// change. Callers waiting in [`allocate()`][Self::allocate] are woken up.
    ///
    /// # Errors
    ///
    /// * [`Error::NotCreated`] if the pool is not created.
    /// * [`Error::NothingToAdd`] if `count` is zero.
    /// * [`Error::AllocationFailed`] if the bulk allocator cannot provide the memory. The pool
    ///   is unchanged.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    pub fn add_memory(&self, count: usize, timeout: Duration) -> Result<()> {
        let layout = *self.layout.get().ok_or(Error::NotCreated)?;
        let count = NonZero::new(count).ok_or(Error::NothingToAdd)?;

        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        self.grow(&mut state, layout, count)?;
        self.chunk_freed.notify_all();

        Ok(())
    }

    /// Slices a caller-provided buffer into blocks and adds them to the pool.
    ///
    /// The usable area starts at the first address in the buffer that satisfies the pool's
    /// alignment. As many whole blocks as fit are added and any remainder is left unused. The
    /// added blocks are zeroed.
    ///
    /// The pool never deallocates adopted buffers. Returns the number of blocks added.
    ///
    /// # Errors
    ///
    /// * [`Error::NotCreated`] if the pool is not created.
    /// * [`Error::BufferTooSmall`] if not even one aligned block fits.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use chunk_pool::ChunkPool;
    ///
    /// let pool = ChunkPool::new(64, 1, 8);
    /// pool.create(Duration::from_secs(1)).unwrap();
    ///
    /// let buffer: &'static mut [u8] = Box::leak(vec![0_u8; 1000].into_boxed_slice());
    /// let added = pool.add_memory_from(buffer, Duration::from_secs(1)).unwrap();
    ///
    /// assert!(added >= 14);
    /// assert_eq!(pool.chunk_count(), 1 + added);
    /// ```
    pub fn add_memory_from(&self, buffer: &'static mut [u8], timeout: Duration) -> Result<usize> {
        let byte_size = buffer.len();
        let start = NonNull::from(buffer).cast::<u8>();

        // SAFETY: The buffer is exclusively borrowed for the rest of the program, so the pool is
        // its sole user from now on and it outlives the pool.
        unsafe { self.add_memory_from_raw(start, byte_size, timeout) }
    }

    /// Slices a caller-provided memory region into blocks and adds them to the pool.
    ///
    /// See [`add_memory_from()`][Self::add_memory_from] for the details.
    ///
    /// # Errors
    ///
    /// The same as [`add_memory_from()`][Self::add_memory_from].
    ///
    /// # Safety
    ///
    /// The caller must guarantee that:
    ///
    /// * `start` is valid for reads and writes of `byte_size` bytes.
    /// * The region stays valid for as long as the pool exists.
    /// * Nothing but the pool (and holders of blocks it hands out) accesses the region from now on.
    /// * The region does not overlap any memory already in the pool.
    ///
    /// The pool does not deallocate the region.
    pub unsafe fn add_memory_from_raw(
        &self,
        start: NonNull<u8>,
        byte_size: usize,
        timeout: Duration,
    ) -> Result<usize> {
        let layout = *self.layout.get().ok_or(Error::NotCreated)?;
        let item_size = layout.item_size();

        let offset = start.as_ptr().align_offset(layout.alignment());
        let usable = byte_size.saturating_sub(offset);
        let count = usable.checked_div(item_size).unwrap_or_default();

        if count == 0 {
            return Err(Error::BufferTooSmall {
                byte_size,
                item_size,
            });
        }

        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        // SAFETY: `offset` is below `byte_size` because at least one block fits after it.
        let base = unsafe { start.byte_add(offset) };

        // Cannot overflow because the product fits inside the buffer.
        let bytes = count.wrapping_mul(item_size);

        // SAFETY: The caller guarantees the region is ours to write, and `bytes` fits in it.
        unsafe {
            ptr::write_bytes(base.as_ptr(), 0, bytes);
        }

        // SAFETY: The region holds `count` blocks and the caller guarantees it does not overlap
        // anything already in the pool.
        let first_index = unsafe { state.chunks.append_region(base, count, item_size) };

        self.chunk_freed.notify_all();

        debug!(
            pool_id = self.pool_id,
            first_index,
            count,
            byte_size,
            "adopted caller buffer"
        );

        Ok(count)
    }

    /// Moves a chunk that nobody holds into or out of quarantine.
    ///
    /// A blocked chunk is skipped by [`allocate()`][Self::allocate] until it is unblocked.
    /// Unblocking a chunk that was quarantined for corruption also repairs its guard bytes.
    ///
    /// If the chunk is currently in use, this waits up to `timeout` for it to be freed.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidChunk`] if `index` is out of range.
    /// * [`Error::StateConflict`] if the chunk stayed in use for the whole `timeout`.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    pub fn set_blocked(&self, index: usize, blocked: bool, timeout: Duration) -> Result<()> {
        let deadline = Deadline::start(&self.clock, timeout);
        let mut state = self.lock_state(&deadline)?;

        loop {
            let chunk_count = state.chunks.len();
            let chunk = state
                .chunks
                .get_mut(index)
                .ok_or(Error::InvalidChunk { index, chunk_count })?;

            if chunk.set_blocked(blocked) {
                if !blocked {
                    self.chunk_freed.notify_all();
                }

                debug!(pool_id = self.pool_id, index, blocked, "chunk state changed");
                return Ok(());
            }

            if !self.wait_for_change(&mut state, &deadline) {
                return Err(Error::StateConflict {
                    index,
                    state: ChunkState::Used,
                });
            }
        }
    }

    /// The state of the chunk at `index`, or `None` if the pool has no such chunk.
    #[must_use]
    pub fn get_state(&self, index: usize) -> Option<ChunkState> {
        self.state.lock().chunks.get(index).map(Chunk::state)
    }

    /// A snapshot of the chunk at `index`.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidChunk`] if `index` is out of range.
    /// * [`Error::LockTimeout`] if the pool lock is not acquired within `timeout`.
    pub fn get_chunk(&self, index: usize, timeout: Duration) -> Result<ChunkInfo> {
        let deadline = Deadline::start(&self.clock, timeout);
        let state = self.lock_state(&deadline)?;

        state
            .chunks
            .get(index)
            .map(|chunk| ChunkInfo::capture(index, chunk))
            .ok_or(Error::InvalidChunk {
                index,
                chunk_count: state.chunks.len(),
            })
    }

    /// Total bytes managed by the pool, in every state. Zero before the pool is created.
    #[must_use]
    pub fn size(&self) -> usize {
        let chunk_count = self.state.lock().chunks.len();

        // Cannot overflow because the same product was allocated when the chunks were added.
        self.item_size().unwrap_or_default().wrapping_mul(chunk_count)
    }

    /// Number of chunks in the pool, in every state. Zero before the pool is created.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Number of chunks currently held by callers.
    #[must_use]
    pub fn get_used(&self) -> usize {
        self.state.lock().chunks.count(ChunkState::Used)
    }

    /// Number of chunks available to the next allocation.
    #[must_use]
    pub fn get_free(&self) -> usize {
        self.state.lock().chunks.count(ChunkState::Free)
    }

    /// Number of chunks in quarantine.
    #[must_use]
    pub fn get_blocked(&self) -> usize {
        self.state.lock().chunks.count(ChunkState::Blocked)
    }

    /// Whether no chunk is available for allocation, because every chunk is either used or
    /// blocked. A pool that is not created is also empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.first_free().is_none()
    }

    /// All the pool's counters, taken under a single lock acquisition.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();

        let mut stats = PoolStats {
            item_size: self.item_size().unwrap_or_default(),
            chunk_count: state.chunks.len(),
            ..PoolStats::default()
        };

        for chunk in state.chunks.iter() {
            let counter = match chunk.state() {
                ChunkState::Free => &mut stats.free,
                ChunkState::Used => &mut stats.used,
                ChunkState::Blocked => &mut stats.blocked,
            };

            // Cannot overflow because we are counting items that exist in memory.
            *counter = counter.wrapping_add(1);

            if chunk.was_corrupted() {
                stats.corrupted = stats.corrupted.wrapping_add(1);
            }
        }

        stats
    }

    /// The padded size of every block, once the pool is created.
    #[must_use]
    pub fn item_size(&self) -> Option<usize> {
        self.layout.get().map(BlockLayout::item_size)
    }

    /// The resolved alignment of every block, once the pool is created.
    #[must_use]
    pub fn alignment(&self) -> Option<usize> {
        self.layout.get().map(BlockLayout::alignment)
    }

    /// Acquires the pool lock within whatever is left of the deadline.
    fn lock_state(&self, deadline: &Deadline) -> Result<MutexGuard<'_, PoolState>> {
        let guard = match deadline.remaining(&self.clock) {
            Remaining::Unbounded => Some(self.state.lock()),
            Remaining::Left(left) => self.state.try_lock_for(left),
            // Even an exhausted budget gets one attempt.
            Remaining::Elapsed => self.state.try_lock(),
        };

        guard.ok_or(Error::LockTimeout {
            timeout: deadline.timeout(),
        })
    }

    /// Releases the lock until a chunk may have become free or the deadline passes.
    ///
    /// Returns `false` without waiting if the deadline has already passed. Waking up does not
    /// guarantee that anything changed, so the caller must re-check.
    #[cfg_attr(test, mutants::skip)] // Mutations cause hangs instead of failures.
    fn wait_for_change(&self, state: &mut MutexGuard<'_, PoolState>, deadline: &Deadline) -> bool {
        match deadline.remaining(&self.clock) {
            Remaining::Unbounded => {
                self.chunk_freed.wait(state);
                true
            }
            Remaining::Left(left) => {
                // Timing out is detected by the next deadline check, not here.
                _ = self.chunk_freed.wait_for(state, left);
                true
            }
            Remaining::Elapsed => false,
        }
    }

    /// Obtains a region for `count` blocks from the bulk allocator and appends its chunks.
    fn grow(
        &self,
        state: &mut PoolState,
        layout: BlockLayout,
        count: NonZero<usize>,
    ) -> Result<()> {
        let count = count.get();

        let bytes = count
            .checked_mul(layout.item_size())
            .ok_or(Error::AllocationFailed { bytes: usize::MAX })?;

        let Ok(region_layout) = Layout::from_size_align(bytes, layout.alignment()) else {
            return Err(Error::AllocationFailed { bytes });
        };

        let base = self
            .allocator
            .allocate(region_layout)
            .ok_or(Error::AllocationFailed { bytes })?;

        // SAFETY: We just allocated `bytes` bytes at `base` and nobody else knows about them.
        unsafe {
            ptr::write_bytes(base.as_ptr(), 0, bytes);
        }

        state.regions.push(OwnedRegion {
            ptr: base,
            layout: region_layout,
        });

        // SAFETY: The region is fresh from the allocator, holds exactly `count` blocks and cannot
        // overlap any memory already in the pool.
        let first_index = unsafe { state.chunks.append_region(base, count, layout.item_size()) };

        debug!(
            pool_id = self.pool_id,
            first_index,
            count,
            bytes,
            "pool grew from bulk allocator"
        );

        Ok(())
    }

    /// Releases the used chunk at `index` and turns the outcome into the public result.
    ///
    /// The chunk is left untouched if the calling thread may not release it.
    fn release(
        &self,
        state: &mut PoolState,
        index: usize,
        layout: BlockLayout,
    ) -> Result<FreeStatus> {
        let Some(chunk) = state.chunks.get_mut(index) else {
            unreachable!("caller verified that chunk {index} exists");
        };

        if !chunk.may_release(thread::current().id()) {
            debug!(
                pool_id = self.pool_id,
                index,
                "free rejected: block is owned by another thread"
            );
            return Err(Error::NotOwner { index });
        }

        let guard_bytes = chunk.guard().bytes();

        // SAFETY: The caller verified the chunk is used, so its block is `item_size` bytes of pool
        // memory. Freeing it hands the bytes back to us, so the holder no longer accesses them.
        let outcome = unsafe { chunk.release(layout.item_size(), self.corruption_policy) };

        // Every outcome moves the chunk out of `Used`, so `set_blocked()` waiters must hear of it
        // even when the chunk ends up blocked.
        self.chunk_freed.notify_all();

        match outcome {
            Release::Clean => {
                trace!(pool_id = self.pool_id, index, "block freed");
                Ok(FreeStatus::Clean)
            }
            Release::Healed => {
                warn!(
                    pool_id = self.pool_id,
                    index,
                    address = chunk.ptr().addr().get(),
                    ?guard_bytes,
                    "chunk guard was damaged; repaired and returned to the pool"
                );
                Ok(FreeStatus::CorruptionHealed)
            }
            Release::Quarantined => {
                warn!(
                    pool_id = self.pool_id,
                    index,
                    address = chunk.ptr().addr().get(),
                    ?guard_bytes,
                    "chunk guard was damaged; chunk has been blocked"
                );
                Err(Error::Corrupted { index })
            }
        }
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        let state = self.state.lock();

        if let Some(layout) = self.layout.get() {
            state.chunks.integrity_check(layout.item_size());

            for chunk in state.chunks.iter() {
                assert_eq!(
                    chunk.ptr().as_ptr().align_offset(layout.alignment()),
                    0,
                    "chunk at {:p} is not aligned to {}",
                    chunk.ptr(),
                    layout.alignment()
                );
            }
        } else {
            assert_eq!(state.chunks.len(), 0, "chunks exist before creation");
        }

        let used = state.chunks.count(ChunkState::Used);
        let free = state.chunks.count(ChunkState::Free);
        let blocked = state.chunks.count(ChunkState::Blocked);

        assert_eq!(
            used + free + blocked,
            state.chunks.len(),
            "states do not add up to the chunk count"
        );
    }

    #[cfg(test)]
    pub(crate) fn damage_guard(&self, index: usize) {
        self.state
            .lock()
            .chunks
            .get_mut(index)
            .expect("test asked to damage a chunk that does not exist")
            .guard_mut()
            .overwrite([0xde, 0xad]);
    }
}

impl<A: BulkAllocator, C: Clock> Drop for ChunkPool<A, C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let used = state.chunks.count(ChunkState::Used);

        for region in state.regions.drain(..) {
            // SAFETY: Every region in the list came from this allocator with this layout and is
            // given back exactly once, here.
            unsafe {
                self.allocator.deallocate(region.ptr, region.layout);
            }
        }

        // We do this check at the end so we clean up the memory first.
        //
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropUsedBlocks) {
            assert!(
                used == 0,
                "dropped a ChunkPool with {used} blocks in use - this is forbidden by DropPolicy::MustNotDropUsedBlocks"
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::MockClock;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const PTR: usize = size_of::<*const u8>();

    assert_impl_all!(ChunkPool: Send, Sync);

    fn created(item_size: usize, element_count: usize, alignment: usize) -> ChunkPool {
        let pool = ChunkPool::new(item_size, element_count, alignment);
        pool.create(TIMEOUT).unwrap();
        pool
    }

    /// A clock that jumps ahead by `step` on every call, so the first deadline check after
    /// starting an operation with a budget of at most `step` always finds the budget used up.
    fn leaping_clock(step: Duration) -> MockClock {
        let start = Instant::now();
        let mut clock = MockClock::new();
        let mut calls: u32 = 0;

        clock.expect_now().returning(move || {
            let now = start + step * calls;
            calls += 1;
            now
        });

        clock
    }

    #[derive(Debug)]
    struct FailingAllocator;

    impl BulkAllocator for FailingAllocator {
        fn allocate(&self, _layout: Layout) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
            unreachable!("nothing was ever allocated");
        }
    }

    #[derive(Debug, Default)]
    struct CountingAllocator {
        live_regions: Arc<AtomicUsize>,
    }

    impl BulkAllocator for CountingAllocator {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            self.live_regions.fetch_add(1, Ordering::Relaxed);
            NonNull::new(unsafe { alloc::alloc(layout) })
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live_regions.fetch_sub(1, Ordering::Relaxed);
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }

    fn block_bytes(handle: BlockHandle) -> &'static mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(handle.ptr().as_ptr(), handle.len()) }
    }

    #[test]
    fn smoke_test() {
        let pool = created(32, 4, 8);

        assert!(pool.is_created());
        assert_eq!(pool.chunk_count(), 4);
        assert_eq!(pool.size(), 128);
        assert_eq!(pool.get_free(), 4);
        assert!(!pool.is_empty());

        let handle = pool.allocate(TIMEOUT).unwrap();
        assert_eq!(handle.len(), 32);
        assert_eq!(pool.get_used(), 1);

        assert_eq!(pool.free(handle, TIMEOUT).unwrap(), FreeStatus::Clean);
        assert_eq!(pool.get_used(), 0);

        pool.integrity_check();
    }

    #[test]
    fn size_and_alignment_are_normalized_on_create() {
        let pool = ChunkPool::new(3, 2, 1);

        assert_eq!(pool.item_size(), None);
        assert_eq!(pool.alignment(), None);

        pool.create(TIMEOUT).unwrap();

        assert_eq!(pool.item_size(), Some(PTR));
        assert_eq!(pool.alignment(), Some(PTR));

        let pool = created(100, 2, 16);
        assert_eq!(pool.item_size(), Some(112));
        assert_eq!(pool.alignment(), Some(16));
    }

    #[test]
    fn every_block_is_aligned() {
        let pool = created(40, 8, 64);
        let mut handles = Vec::new();

        while let Some(handle) = pool.allocate(Duration::ZERO) {
            assert_eq!(handle.ptr().as_ptr().align_offset(64), 0);
            handles.push(handle);
        }

        assert_eq!(handles.len(), 8);
        pool.integrity_check();
    }

    #[test]
    fn create_twice_fails() {
        let pool = created(16, 2, 8);

        assert!(matches!(pool.create(TIMEOUT), Err(Error::AlreadyCreated)));
        assert_eq!(pool.chunk_count(), 2);
    }

    #[test]
    fn create_with_invalid_alignment_touches_nothing() {
        let pool = ChunkPool::new(16, 4, 24);

        assert!(matches!(
            pool.create(TIMEOUT),
            Err(Error::InvalidAlignment { requested: 24 })
        ));
        assert!(!pool.is_created());
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn create_with_zero_item_size_fails() {
        let pool = ChunkPool::new(0, 4, 8);

        assert!(matches!(
            pool.create(TIMEOUT),
            Err(Error::InvalidItemSize { item_size: 0, .. })
        ));
        assert!(!pool.is_created());
    }

    #[test]
    fn create_with_zero_elements_fails() {
        let pool = ChunkPool::new(16, 0, 8);

        assert!(matches!(pool.create(TIMEOUT), Err(Error::NothingToAdd)));
        assert!(!pool.is_created());
    }

    #[test]
    fn create_fails_cleanly_when_allocator_fails() {
        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(4))
            .allocator(FailingAllocator)
            .build();

        assert!(matches!(
            pool.create(TIMEOUT),
            Err(Error::AllocationFailed { bytes: 64 })
        ));
        assert!(!pool.is_created());
        assert_eq!(pool.chunk_count(), 0);
    }

    #[test]
    fn allocate_before_create_fails_immediately() {
        let pool = ChunkPool::new(16, 4, 8);

        let started = Instant::now();
        assert!(pool.allocate(TIMEOUT).is_none());
        assert!(matches!(
            pool.try_allocate(TIMEOUT),
            Err(Error::NotCreated)
        ));

        // Must not have waited for the timeout.
        assert!(started.elapsed() < TIMEOUT);
    }

    #[test]
    fn blocks_are_handed_out_in_chunk_order() {
        let pool = created(16, 3, 8);

        let a = pool.allocate(TIMEOUT).unwrap();
        let b = pool.allocate(TIMEOUT).unwrap();
        let c = pool.allocate(TIMEOUT).unwrap();

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(c.index(), 2);

        pool.free(b, TIMEOUT).unwrap();

        // The freed chunk is the first free one again.
        let d = pool.allocate(TIMEOUT).unwrap();
        assert_eq!(d.index(), 1);
        assert_eq!(d.ptr(), b.ptr());
    }

    #[test]
    fn exhausted_pool_times_out_on_mock_clock() {
        let timeout = Duration::from_secs(3600);

        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(1))
            .clock(leaping_clock(timeout))
            .build();

        pool.create(TIMEOUT).unwrap();
        let _held = pool.try_allocate(TIMEOUT).unwrap();

        // The clock jumps past the hour-long deadline, so this fails without really waiting.
        let result = pool.try_allocate(timeout);

        assert!(matches!(result, Err(Error::Exhausted { timeout: t }) if t == timeout));
    }

    #[test]
    fn exhausted_pool_times_out_on_real_clock() {
        let pool = created(16, 1, 8);
        let _held = pool.allocate(TIMEOUT).unwrap();

        let started = Instant::now();
        let result = pool.try_allocate(Duration::from_millis(20));

        assert!(matches!(result, Err(Error::Exhausted { .. })));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(result.unwrap_err().is_timeout());
    }

    #[test]
    fn lock_timeout_when_lock_is_held() {
        let pool = created(16, 2, 8);

        let _guard = pool.state.lock();

        let result = pool.try_allocate(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::LockTimeout { .. })));

        let result = pool.add_memory(1, Duration::ZERO);
        assert!(matches!(result, Err(Error::LockTimeout { .. })));
    }

    #[test]
    fn allocated_blocks_are_zeroed() {
        let pool = created(64, 1, 8);

        let handle = pool.allocate(TIMEOUT).unwrap();
        assert!(block_bytes(handle).iter().all(|b| *b == 0));

        block_bytes(handle).fill(0xab);
        pool.free(handle, TIMEOUT).unwrap();

        let handle = pool.allocate(TIMEOUT).unwrap();
        assert!(block_bytes(handle).iter().all(|b| *b == 0));
    }

    #[test]
    fn double_free_is_not_found() {
        let pool = created(16, 2, 8);
        let handle = pool.allocate(TIMEOUT).unwrap();

        pool.free(handle, TIMEOUT).unwrap();

        let result = pool.free(handle, TIMEOUT);
        assert!(matches!(result, Err(Error::NotFound { address }) if address == handle.ptr().addr().get()));
        assert_eq!(pool.get_free(), 2);
    }

    #[test]
    fn free_from_other_pool_is_not_found() {
        let pool_a = created(16, 2, 8);
        let pool_b = created(16, 2, 8);

        let handle = pool_a.allocate(TIMEOUT).unwrap();

        assert!(matches!(
            pool_b.free(handle, TIMEOUT),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(pool_a.get_used(), 1);
        assert_eq!(pool_b.get_used(), 0);

        pool_a.free(handle, TIMEOUT).unwrap();
    }

    #[test]
    fn free_ptr_finds_block_by_address() {
        let pool = created(16, 4, 8);

        _ = pool.allocate(TIMEOUT).unwrap();
        let handle = pool.allocate(TIMEOUT).unwrap();

        assert_eq!(
            pool.free_ptr(handle.ptr(), TIMEOUT).unwrap(),
            FreeStatus::Clean
        );
        assert_eq!(pool.get_state(1), Some(ChunkState::Free));
        assert_eq!(pool.get_used(), 1);
    }

    #[test]
    fn free_ptr_rejects_unknown_and_interior_addresses() {
        let pool = created(16, 2, 8);
        let handle = pool.allocate(TIMEOUT).unwrap();

        let interior = unsafe { handle.ptr().byte_add(8) };
        assert!(matches!(
            pool.free_ptr(interior, TIMEOUT),
            Err(Error::NotFound { .. })
        ));

        let mut outside = 0_u64;
        assert!(matches!(
            pool.free_ptr(NonNull::from(&mut outside).cast(), TIMEOUT),
            Err(Error::NotFound { .. })
        ));

        // A free chunk is not a valid target either.
        let second = unsafe { handle.ptr().byte_add(16) };
        assert!(matches!(
            pool.free_ptr(second, TIMEOUT),
            Err(Error::NotFound { .. })
        ));

        assert_eq!(pool.get_used(), 1);
    }

    #[test]
    fn free_ptr_before_create_is_not_found() {
        let pool = ChunkPool::new(16, 1, 8);
        let mut outside = 0_u64;
        let ptr = NonNull::from(&mut outside).cast::<u8>();

        let result = pool.free_ptr(ptr, TIMEOUT);

        assert!(matches!(result, Err(Error::NotFound { address }) if address == ptr.addr().get()));
        assert!(!pool.is_created());
    }

    #[test]
    fn damaged_guard_is_healed_by_default() {
        let pool = created(16, 2, 8);
        let handle = pool.allocate(TIMEOUT).unwrap();

        pool.damage_guard(handle.index());

        let status = pool.free(handle, TIMEOUT).unwrap();
        assert_eq!(status, FreeStatus::CorruptionHealed);
        assert!(status.was_corrupted());

        let info = pool.get_chunk(handle.index(), TIMEOUT).unwrap();
        assert_eq!(info.state(), ChunkState::Free);
        assert!(info.guard_intact());
        assert!(info.was_corrupted());
        assert_eq!(pool.stats().corrupted(), 1);

        // The healed chunk is back in circulation and frees cleanly next time.
        let handle = pool.allocate(TIMEOUT).unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(pool.free(handle, TIMEOUT).unwrap(), FreeStatus::Clean);
        assert!(pool.get_chunk(0, TIMEOUT).unwrap().was_corrupted());
    }

    #[test]
    fn damaged_guard_is_quarantined_when_rejecting() {
        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(2))
            .corruption_policy(CorruptionPolicy::Reject)
            .build();
        pool.create(TIMEOUT).unwrap();

        let handle = pool.allocate(TIMEOUT).unwrap();
        block_bytes(handle).fill(0x11);
        pool.damage_guard(handle.index());

        assert!(matches!(
            pool.free(handle, TIMEOUT),
            Err(Error::Corrupted { index: 0 })
        ));

        let info = pool.get_chunk(0, TIMEOUT).unwrap();
        assert_eq!(info.state(), ChunkState::Blocked);
        assert!(!info.guard_intact());
        assert!(info.was_corrupted());
        assert_eq!(pool.get_blocked(), 1);

        // Contents are wiped even though the chunk is quarantined.
        assert!(block_bytes(handle).iter().all(|b| *b == 0));

        // Allocation skips the quarantined chunk.
        let next = pool.allocate(TIMEOUT).unwrap();
        assert_eq!(next.index(), 1);

        pool.set_blocked(0, false, TIMEOUT).unwrap();
        let info = pool.get_chunk(0, TIMEOUT).unwrap();
        assert_eq!(info.state(), ChunkState::Free);
        assert!(info.guard_intact());
    }

    #[test]
    fn quarantine_wakes_waiting_set_blocked() {
        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(1))
            .corruption_policy(CorruptionPolicy::Reject)
            .build();
        pool.create(TIMEOUT).unwrap();

        let handle = pool.allocate(TIMEOUT).unwrap();
        pool.damage_guard(handle.index());

        thread::scope(|s| {
            let unblocker = s.spawn(|| {
                let started = Instant::now();
                let result = pool.set_blocked(0, false, TIMEOUT);
                (result, started.elapsed())
            });

            thread::sleep(Duration::from_millis(100));

            assert!(matches!(
                pool.free(handle, TIMEOUT),
                Err(Error::Corrupted { index: 0 })
            ));

            let (result, elapsed) = unblocker.join().unwrap();
            result.unwrap();

            // Woken by the quarantine rather than by its own deadline.
            assert!(elapsed < TIMEOUT / 2, "waited {elapsed:?}");
        });

        let info = pool.get_chunk(0, TIMEOUT).unwrap();
        assert_eq!(info.state(), ChunkState::Free);
        assert!(info.guard_intact());
    }

    #[test]
    fn owned_block_cannot_be_freed_by_another_thread() {
        let pool = created(16, 2, 8);

        let handle = pool.try_allocate_owned(TIMEOUT).unwrap();
        block_bytes(handle).fill(0x33);

        let me = thread::current().id();
        assert_eq!(pool.get_chunk(0, TIMEOUT).unwrap().owner(), Some(me));

        thread::scope(|s| {
            s.spawn(|| {
                assert!(matches!(
                    pool.free(handle, TIMEOUT),
                    Err(Error::NotOwner { index: 0 })
                ));
                assert!(matches!(
                    pool.free_ptr(handle.ptr(), TIMEOUT),
                    Err(Error::NotOwner { index: 0 })
                ));
            });
        });

        // The rejected frees changed nothing.
        assert_eq!(pool.get_state(0), Some(ChunkState::Used));
        assert_eq!(pool.get_used(), 1);
        assert!(block_bytes(handle).iter().all(|b| *b == 0x33));

        assert_eq!(pool.free(handle, TIMEOUT).unwrap(), FreeStatus::Clean);
        assert_eq!(pool.get_chunk(0, TIMEOUT).unwrap().owner(), None);
        assert_eq!(pool.get_free(), 2);

        pool.integrity_check();
    }

    #[test]
    fn recycled_owned_block_is_shared_again() {
        let pool = created(16, 1, 8);

        let owned = pool.allocate_owned(TIMEOUT).unwrap();
        pool.free(owned, TIMEOUT).unwrap();

        let shared = pool.allocate(TIMEOUT).unwrap();
        assert_eq!(shared.index(), owned.index());

        thread::scope(|s| {
            let status = s.spawn(|| pool.free(shared, TIMEOUT)).join().unwrap();
            assert_eq!(status.unwrap(), FreeStatus::Clean);
        });
    }

    #[test]
    fn shared_block_can_be_freed_by_any_thread() {
        let pool = created(16, 1, 8);
        let handle = pool.allocate(TIMEOUT).unwrap();

        assert_eq!(pool.get_chunk(0, TIMEOUT).unwrap().owner(), None);

        thread::scope(|s| {
            let status = s.spawn(|| pool.free(handle, TIMEOUT)).join().unwrap();
            assert_eq!(status.unwrap(), FreeStatus::Clean);
        });

        assert_eq!(pool.get_free(), 1);
    }

    #[test]
    fn owned_allocation_before_create_fails_immediately() {
        let pool = ChunkPool::new(16, 1, 8);

        assert!(matches!(
            pool.try_allocate_owned(TIMEOUT),
            Err(Error::NotCreated)
        ));
        assert!(pool.allocate_owned(Duration::ZERO).is_none());
    }

    #[test]
    fn add_memory_appends_chunks() {
        let pool = created(16, 2, 8);
        let first = pool.allocate(TIMEOUT).unwrap();

        pool.add_memory(3, TIMEOUT).unwrap();

        assert_eq!(pool.chunk_count(), 5);
        assert_eq!(pool.size(), 80);
        assert_eq!(pool.get_free(), 4);

        // Existing chunks keep their identity.
        assert_eq!(pool.get_chunk(0, TIMEOUT).unwrap().address(), first.ptr());
        assert_eq!(pool.get_state(0), Some(ChunkState::Used));

        pool.integrity_check();
    }

    #[test]
    fn add_memory_zero_is_rejected() {
        let pool = created(16, 2, 8);

        assert!(matches!(
            pool.add_memory(0, TIMEOUT),
            Err(Error::NothingToAdd)
        ));
        assert_eq!(pool.chunk_count(), 2);
    }

    #[test]
    fn add_memory_before_create_fails() {
        let pool = ChunkPool::new(16, 2, 8);

        assert!(matches!(
            pool.add_memory(1, TIMEOUT),
            Err(Error::NotCreated)
        ));
    }

    #[test]
    fn adopted_buffer_is_aligned_and_zeroed() {
        let pool = created(24, 1, 16);
        assert_eq!(pool.item_size(), Some(32));

        let buffer = Box::leak(vec![0xff_u8; 200].into_boxed_slice());
        let base = buffer.as_mut_ptr();
        let offset = base.align_offset(16);

        let added = pool.add_memory_from(buffer, TIMEOUT).unwrap();

        assert_eq!(added, (200 - offset) / 32);
        assert_eq!(pool.chunk_count(), 1 + added);

        for index in 1..=added {
            let info = pool.get_chunk(index, TIMEOUT).unwrap();
            assert_eq!(info.address().as_ptr().align_offset(16), 0);
            assert_eq!(info.state(), ChunkState::Free);
        }

        let adopted = pool.get_chunk(1, TIMEOUT).unwrap().address();
        assert_eq!(adopted.as_ptr(), base.wrapping_add(offset));

        let bytes = unsafe { std::slice::from_raw_parts(adopted.as_ptr(), 32 * added) };
        assert!(bytes.iter().all(|b| *b == 0));

        pool.integrity_check();
    }

    #[test]
    fn adopted_buffer_too_small_is_rejected() {
        let pool = created(64, 1, 8);

        let buffer = Box::leak(vec![0_u8; 63].into_boxed_slice());

        assert!(matches!(
            pool.add_memory_from(buffer, TIMEOUT),
            Err(Error::BufferTooSmall {
                byte_size: 63,
                item_size: 64
            })
        ));
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn adopted_buffer_before_create_fails() {
        let pool = ChunkPool::new(16, 1, 8);
        let buffer = Box::leak(vec![0_u8; 64].into_boxed_slice());

        assert!(matches!(
            pool.add_memory_from(buffer, TIMEOUT),
            Err(Error::NotCreated)
        ));
    }

    #[test]
    fn set_blocked_takes_chunk_out_of_circulation() {
        let pool = created(16, 2, 8);

        pool.set_blocked(0, true, TIMEOUT).unwrap();
        assert_eq!(pool.get_state(0), Some(ChunkState::Blocked));
        assert_eq!(pool.get_blocked(), 1);

        let handle = pool.allocate(TIMEOUT).unwrap();
        assert_eq!(handle.index(), 1);

        // Only blocked and used chunks remain.
        assert!(pool.is_empty());
        assert!(pool.allocate(Duration::ZERO).is_none());

        pool.set_blocked(0, false, TIMEOUT).unwrap();
        assert!(!pool.is_empty());
        assert_eq!(pool.allocate(TIMEOUT).unwrap().index(), 0);
    }

    #[test]
    fn set_blocked_on_used_chunk_times_out() {
        let pool = created(16, 1, 8);
        let _handle = pool.allocate(TIMEOUT).unwrap();

        let result = pool.set_blocked(0, true, Duration::from_millis(10));

        assert!(matches!(
            result,
            Err(Error::StateConflict {
                index: 0,
                state: ChunkState::Used
            })
        ));
        assert_eq!(pool.get_state(0), Some(ChunkState::Used));
    }

    #[test]
    fn set_blocked_out_of_range_is_invalid() {
        let pool = created(16, 2, 8);

        assert!(matches!(
            pool.set_blocked(2, true, TIMEOUT),
            Err(Error::InvalidChunk {
                index: 2,
                chunk_count: 2
            })
        ));
        assert!(matches!(
            pool.get_chunk(7, TIMEOUT),
            Err(Error::InvalidChunk { index: 7, .. })
        ));
        assert_eq!(pool.get_state(2), None);
    }

    #[test]
    fn stats_match_individual_counters() {
        let pool = created(16, 5, 8);

        let _a = pool.allocate(TIMEOUT).unwrap();
        let _b = pool.allocate(TIMEOUT).unwrap();
        pool.set_blocked(4, true, TIMEOUT).unwrap();

        let stats = pool.stats();

        assert_eq!(stats.item_size(), 16);
        assert_eq!(stats.chunk_count(), pool.chunk_count());
        assert_eq!(stats.used(), pool.get_used());
        assert_eq!(stats.free(), pool.get_free());
        assert_eq!(stats.blocked(), pool.get_blocked());
        assert_eq!(stats.used(), 2);
        assert_eq!(stats.free(), 2);
        assert_eq!(stats.blocked(), 1);
        assert_eq!(stats.capacity_bytes(), pool.size());
        assert_eq!(stats.used_bytes(), 32);
        assert_eq!(stats.free_bytes(), 32);
    }

    #[test]
    fn drop_returns_every_region_to_allocator() {
        let allocator = CountingAllocator::default();
        let live_regions = Arc::clone(&allocator.live_regions);

        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(2))
            .allocator(allocator)
            .build();

        pool.create(TIMEOUT).unwrap();
        pool.add_memory(4, TIMEOUT).unwrap();
        pool.add_memory(1, TIMEOUT).unwrap();
        _ = pool.allocate(TIMEOUT).unwrap();

        assert_eq!(live_regions.load(Ordering::Relaxed), 3);

        drop(pool);

        assert_eq!(live_regions.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic]
    fn drop_with_used_blocks_panics_if_forbidden() {
        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(2))
            .drop_policy(DropPolicy::MustNotDropUsedBlocks)
            .build();

        pool.create(TIMEOUT).unwrap();
        _ = pool.allocate(TIMEOUT).unwrap();

        drop(pool);
    }

    #[test]
    fn drop_without_used_blocks_is_fine_if_forbidden() {
        let pool = ChunkPool::builder()
            .item_size(16)
            .element_count(nz!(2))
            .drop_policy(DropPolicy::MustNotDropUsedBlocks)
            .build();

        pool.create(TIMEOUT).unwrap();
        let handle = pool.allocate(TIMEOUT).unwrap();
        pool.free(handle, TIMEOUT).unwrap();

        drop(pool);
    }

    #[test]
    fn invariants_hold_through_mixed_operations() {
        let pool = created(48, 3, 16);

        let a = pool.allocate(TIMEOUT).unwrap();
        pool.add_memory(2, TIMEOUT).unwrap();
        let b = pool.allocate(TIMEOUT).unwrap();
        pool.set_blocked(4, true, TIMEOUT).unwrap();
        pool.free(a, TIMEOUT).unwrap();

        let stats = pool.stats();
        assert_eq!(
            stats.used() + stats.free() + stats.blocked(),
            stats.chunk_count()
        );
        assert_eq!(pool.size(), 48 * pool.chunk_count());

        pool.free(b, TIMEOUT).unwrap();
        pool.integrity_check();
    }
}
