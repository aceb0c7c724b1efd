use std::alloc::{self, Layout};
use std::fmt::Debug;
use std::ptr::NonNull;

/// Source of the backing storage that a [`ChunkPool`][crate::ChunkPool] slices into chunks.
///
/// The pool asks for one region per growth batch and gives every region back when it is dropped.
/// It never frees individual chunks to the allocator.
pub trait BulkAllocator: Debug + Send + Sync + 'static {
    /// Allocates a region described by `layout`, which always has a non-zero size.
    ///
    /// Returns `None` if the memory cannot be provided.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] on the same allocator with
    /// the same `layout`, and must not have been deallocated since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default [`BulkAllocator`], backed by the global Rust allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl BulkAllocator for SystemAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);

        // SAFETY: The layout has a non-zero size, which is the only requirement of `alloc`.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding the guarantee from our caller that the pointer came from `alloc`
        // with this same layout.
        unsafe {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// A region that the pool obtained from its bulk allocator and must give back on drop.
#[derive(Debug)]
pub(crate) struct OwnedRegion {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) layout: Layout,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SystemAllocator: BulkAllocator, Copy);

    #[test]
    fn system_allocator_respects_alignment() {
        let allocator = SystemAllocator;
        let layout = Layout::from_size_align(256, 64).unwrap();

        let ptr = allocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);

        unsafe {
            allocator.deallocate(ptr, layout);
        }
    }
}
