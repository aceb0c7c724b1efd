use std::ptr::NonNull;

/// A block handed out by [`ChunkPool::allocate()`][crate::ChunkPool::allocate].
///
/// The handle is a plain address plus the bookkeeping needed to give the block back in constant
/// time. It does not borrow the pool and it does not free the block when dropped. Return it with
/// [`ChunkPool::free()`][crate::ChunkPool::free].
///
/// Reading or writing the block requires `unsafe` code through [`ptr()`][Self::ptr]. The block is
/// valid for [`len()`][Self::len] bytes, aligned to the pool's alignment, for as long as the handle
/// has not been freed and the pool has not been dropped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use chunk_pool::ChunkPool;
///
/// let pool = ChunkPool::new(64, 4, 8);
/// pool.create(Duration::from_secs(1)).unwrap();
///
/// let block = pool.allocate(Duration::from_secs(1)).unwrap();
///
/// // SAFETY: The block is `block.len()` bytes that only we are using until we free it.
/// let bytes = unsafe { std::slice::from_raw_parts_mut(block.ptr().as_ptr(), block.len()) };
/// bytes[0] = 42;
///
/// pool.free(block, Duration::from_secs(1)).unwrap();
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockHandle {
    pool_id: u64,
    index: usize,
    ptr: NonNull<u8>,
    len: usize,
}

#[allow(clippy::len_without_is_empty, reason = "a block is never empty")]
impl BlockHandle {
    #[must_use]
    pub(crate) fn new(pool_id: u64, index: usize, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            pool_id,
            index,
            ptr,
            len,
        }
    }

    /// Address of the first byte of the block.
    #[must_use]
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the block in bytes. This is the pool's padded item size.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Position of the block's chunk in the pool, usable with the administrative operations.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

// SAFETY: The handle is only an address. Touching the memory behind it requires unsafe code whose
// author takes responsibility for synchronization, so moving the address itself is harmless.
unsafe impl Send for BlockHandle {}

// SAFETY: See above. Shared access to the handle only exposes the address.
unsafe impl Sync for BlockHandle {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BlockHandle: Send, Sync, Copy);

    #[test]
    fn accessors_report_construction_values() {
        let mut storage = [0_u8; 16];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();

        let handle = BlockHandle::new(7, 3, ptr, 16);

        assert_eq!(handle.ptr(), ptr);
        assert_eq!(handle.len(), 16);
        assert_eq!(handle.index(), 3);
        assert_eq!(handle.pool_id(), 7);
    }
}
