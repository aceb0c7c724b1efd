use std::ptr::NonNull;
use std::thread::ThreadId;

use crate::{Chunk, ChunkState};

/// Ordered, append-only collection of chunk records.
///
/// The position of a chunk in the table is its identity for administrative operations. Chunks
/// are never removed, only recycled by state, so positions stay stable for the life of the pool.
#[derive(Debug, Default)]
pub(crate) struct ChunkTable {
    chunks: Vec<Chunk>,
}

impl ChunkTable {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub(crate) fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(index)
    }

    /// Appends `count` chunks carved out of a contiguous region starting at `base`, each
    /// `item_size` bytes long. Returns the index of the first appended chunk.
    ///
    /// # Safety
    ///
    /// The region must be at least `count * item_size` bytes and must not overlap the block of
    /// any chunk already in the table.
    pub(crate) unsafe fn append_region(
        &mut self,
        base: NonNull<u8>,
        count: usize,
        item_size: usize,
    ) -> usize {
        let first_index = self.chunks.len();
        self.chunks.reserve(count);

        for index in 0..count {
            // Cannot overflow because the caller guarantees the region spans all the blocks.
            let offset = index.wrapping_mul(item_size);

            // SAFETY: The caller guarantees the region holds `count` blocks of `item_size` bytes,
            // so every offset we compute stays inside it.
            let block = unsafe { base.byte_add(offset) };

            self.chunks.push(Chunk::new(block));
        }

        first_index
    }

    /// Index of the first free chunk in table order.
    #[must_use]
    pub(crate) fn first_free(&self) -> Option<usize> {
        self.chunks
            .iter()
            .position(|chunk| chunk.state() == ChunkState::Free)
    }

    /// Marks the first free chunk as used and returns its index and block address.
    pub(crate) fn claim_first_free(
        &mut self,
        owner: Option<ThreadId>,
    ) -> Option<(usize, NonNull<u8>)> {
        let index = self.first_free()?;
        let chunk = self.chunks.get_mut(index)?;

        chunk.mark_used(owner);

        Some((index, chunk.ptr()))
    }

    /// Index of the chunk whose block starts at `ptr`.
    #[must_use]
    pub(crate) fn index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.chunks.iter().position(|chunk| chunk.ptr() == ptr)
    }

    /// Number of chunks currently in `state`.
    #[must_use]
    pub(crate) fn count(&self, state: ChunkState) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.state() == state)
            .count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    /// Asserts that no two chunks in the table overlap, given the block size.
    pub(crate) fn integrity_check(&self, item_size: usize) {
        let mut starts = self
            .chunks
            .iter()
            .map(|chunk| chunk.ptr().as_ptr() as usize)
            .collect::<Vec<_>>();
        starts.sort_unstable();

        for pair in starts.windows(2) {
            let [previous, next] = pair else {
                unreachable!("windows(2) always yields pairs");
            };

            assert!(
                previous.checked_add(item_size).expect("address space overflow") <= *next,
                "chunk at {previous:#x} overlaps chunk at {next:#x} with item size {item_size}"
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
    use super::*;

    fn region(storage: &mut [u8]) -> NonNull<u8> {
        NonNull::new(storage.as_mut_ptr()).unwrap()
    }

    #[test]
    fn starts_empty() {
        let table = ChunkTable::new();

        assert_eq!(table.len(), 0);
        assert_eq!(table.first_free(), None);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn append_region_slices_in_order() {
        let mut storage = [0_u8; 64];
        let base = region(&mut storage);
        let mut table = ChunkTable::new();

        let first = unsafe { table.append_region(base, 4, 16) };

        assert_eq!(first, 0);
        assert_eq!(table.len(), 4);

        for index in 0..4 {
            let expected = unsafe { base.byte_add(index * 16) };
            assert_eq!(table.get(index).unwrap().ptr(), expected);
            assert_eq!(table.get(index).unwrap().state(), ChunkState::Free);
        }

        table.integrity_check(16);
    }

    #[test]
    fn second_region_is_appended_after_first() {
        let mut storage_a = [0_u8; 32];
        let mut storage_b = [0_u8; 48];
        let mut table = ChunkTable::new();

        _ = unsafe { table.append_region(region(&mut storage_a), 2, 16) };
        let first = unsafe { table.append_region(region(&mut storage_b), 3, 16) };

        assert_eq!(first, 2);
        assert_eq!(table.len(), 5);
        assert_eq!(table.get(2).unwrap().ptr(), region(&mut storage_b));

        table.integrity_check(16);
    }

    #[test]
    fn first_free_skips_used_and_blocked() {
        let mut storage = [0_u8; 48];
        let mut table = ChunkTable::new();
        _ = unsafe { table.append_region(region(&mut storage), 3, 16) };

        table.get_mut(0).unwrap().mark_used(None);
        assert!(table.get_mut(1).unwrap().set_blocked(true));

        assert_eq!(table.first_free(), Some(2));

        table.get_mut(2).unwrap().mark_used(None);
        assert_eq!(table.first_free(), None);
    }

    #[test]
    fn claim_first_free_marks_used_in_order() {
        let mut storage = [0_u8; 32];
        let base = region(&mut storage);
        let mut table = ChunkTable::new();
        _ = unsafe { table.append_region(base, 2, 16) };

        assert_eq!(table.claim_first_free(None), Some((0, base)));
        assert_eq!(
            table.claim_first_free(None),
            Some((1, unsafe { base.byte_add(16) }))
        );
        assert_eq!(table.claim_first_free(None), None);
        assert_eq!(table.count(ChunkState::Used), 2);
    }

    #[test]
    fn claim_first_free_records_owner() {
        let mut storage = [0_u8; 16];
        let base = region(&mut storage);
        let mut table = ChunkTable::new();
        _ = unsafe { table.append_region(base, 1, 16) };

        let me = std::thread::current().id();
        assert_eq!(table.claim_first_free(Some(me)), Some((0, base)));
        assert_eq!(table.get(0).unwrap().owner(), Some(me));
    }

    #[test]
    fn counts_by_state() {
        let mut storage = [0_u8; 64];
        let mut table = ChunkTable::new();
        _ = unsafe { table.append_region(region(&mut storage), 4, 16) };

        table.get_mut(0).unwrap().mark_used(None);
        table.get_mut(1).unwrap().mark_used(None);
        assert!(table.get_mut(3).unwrap().set_blocked(true));

        assert_eq!(table.count(ChunkState::Used), 2);
        assert_eq!(table.count(ChunkState::Free), 1);
        assert_eq!(table.count(ChunkState::Blocked), 1);
        assert_eq!(table.iter().count(), 4);
    }

    #[test]
    fn index_of_finds_by_address() {
        let mut storage = [0_u8; 64];
        let base = region(&mut storage);
        let mut table = ChunkTable::new();
        _ = unsafe { table.append_region(base, 4, 16) };

        assert_eq!(table.index_of(base), Some(0));
        assert_eq!(table.index_of(unsafe { base.byte_add(48) }), Some(3));

        // Addresses inside a block are not block addresses.
        assert_eq!(table.index_of(unsafe { base.byte_add(8) }), None);
    }

    #[test]
    #[should_panic]
    fn integrity_check_detects_overlap() {
        let mut storage = [0_u8; 64];
        let base = region(&mut storage);
        let mut table = ChunkTable::new();

        _ = unsafe { table.append_region(base, 2, 16) };
        _ = unsafe { table.append_region(base.byte_add(8), 1, 16) };

        table.integrity_check(16);
    }
}
