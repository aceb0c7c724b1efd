/// Sentinel written into the first guard byte of every chunk.
pub(crate) const GUARD_START: u8 = 0x6d;

/// Sentinel written into the second guard byte of every chunk.
pub(crate) const GUARD_END: u8 = 0xa8;

/// Two sentinel bytes stored next to the bookkeeping fields of a chunk.
///
/// Any stray write that lands on the chunk record is likely to clobber at least one of the bytes,
/// which the pool detects the next time the chunk is released.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub(crate) struct ChunkGuard {
    bytes: [u8; 2],
}

impl ChunkGuard {
    /// A guard holding the expected sentinel values.
    #[must_use]
    pub(crate) const fn intact() -> Self {
        Self {
            bytes: [GUARD_START, GUARD_END],
        }
    }

    /// Whether both sentinel bytes still hold their expected values.
    #[must_use]
    pub(crate) fn is_intact(&self) -> bool {
        self.bytes == [GUARD_START, GUARD_END]
    }

    /// Re-writes both sentinel bytes to their expected values.
    pub(crate) fn restore(&mut self) {
        *self = Self::intact();
    }

    /// Raw view of the two guard bytes, for diagnostics.
    #[must_use]
    pub(crate) fn bytes(&self) -> [u8; 2] {
        self.bytes
    }

    #[cfg(test)]
    pub(crate) fn overwrite(&mut self, bytes: [u8; 2]) {
        self.bytes = bytes;
    }
}

impl Default for ChunkGuard {
    fn default() -> Self {
        Self::intact()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn intact_guard_is_intact() {
        let guard = ChunkGuard::intact();

        assert!(guard.is_intact());
        assert_eq!(guard.bytes(), [0x6d, 0xa8]);
        assert_eq!(guard, ChunkGuard::default());
    }

    #[test]
    fn either_byte_damaged_is_detected() {
        let mut guard = ChunkGuard::intact();
        guard.overwrite([GUARD_START, 0]);
        assert!(!guard.is_intact());

        guard.overwrite([0, GUARD_END]);
        assert!(!guard.is_intact());

        guard.overwrite([0xff, 0xff]);
        assert!(!guard.is_intact());
    }

    #[test]
    fn swapped_sentinels_are_not_intact() {
        let mut guard = ChunkGuard::intact();
        guard.overwrite([GUARD_END, GUARD_START]);

        assert!(!guard.is_intact());
    }

    #[test]
    fn restore_repairs_damage() {
        let mut guard = ChunkGuard::intact();
        guard.overwrite([1, 2]);

        guard.restore();

        assert!(guard.is_intact());
    }
}
