use std::mem;

use crate::{Error, Result};

/// Alignments are accepted only if they are `1 << n` for `n` below this.
pub(crate) const ALIGNMENT_BITS: u32 = 31;

/// Resolved size and alignment of every block in a pool.
///
/// Calculated once, when the pool is created. Every growth batch slices its memory with the same
/// values, so blocks from different batches are interchangeable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BlockLayout {
    item_size: usize,
    alignment: usize,
}

impl BlockLayout {
    /// Validates the requested alignment and pads the requested item size to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAlignment`] if the alignment (after raising it to pointer size) is
    /// not a supported power of two, and [`Error::InvalidItemSize`] if the item size is zero or
    /// cannot be padded without overflow.
    pub(crate) fn normalize(item_size: usize, alignment: usize) -> Result<Self> {
        let resolved_alignment =
            resolve_alignment(alignment).ok_or(Error::InvalidAlignment {
                requested: alignment,
            })?;

        let padded = padded_item_size(item_size, resolved_alignment).ok_or(
            Error::InvalidItemSize {
                item_size,
                alignment: resolved_alignment,
            },
        )?;

        Ok(Self {
            item_size: padded,
            alignment: resolved_alignment,
        })
    }

    #[must_use]
    pub(crate) fn item_size(&self) -> usize {
        self.item_size
    }

    #[must_use]
    pub(crate) fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Raises the alignment to pointer size and checks that it is a supported power of two.
#[must_use]
pub(crate) fn resolve_alignment(requested: usize) -> Option<usize> {
    let alignment = requested.max(mem::size_of::<*const u8>());

    (alignment.is_power_of_two() && alignment.trailing_zeros() < ALIGNMENT_BITS)
        .then_some(alignment)
}

/// Pads the item size to a whole multiple of the alignment, never below one alignment unit.
#[must_use]
pub(crate) fn padded_item_size(item_size: usize, alignment: usize) -> Option<usize> {
    if item_size == 0 {
        return None;
    }

    if item_size <= alignment {
        return Some(alignment);
    }

    item_size.checked_next_multiple_of(alignment)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const PTR: usize = mem::size_of::<*const u8>();

    #[test]
    fn small_alignment_is_raised_to_pointer_size() {
        assert_eq!(resolve_alignment(0), Some(PTR));
        assert_eq!(resolve_alignment(1), Some(PTR));
        assert_eq!(resolve_alignment(2), Some(PTR));
    }

    #[test]
    fn power_of_two_alignment_is_kept() {
        assert_eq!(resolve_alignment(16), Some(16));
        assert_eq!(resolve_alignment(4096), Some(4096));
        assert_eq!(resolve_alignment(1 << 30), Some(1 << 30));
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        assert_eq!(resolve_alignment(24), None);
        assert_eq!(resolve_alignment(100), None);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn alignment_beyond_supported_bits_is_rejected() {
        assert_eq!(resolve_alignment(1 << 31), None);
        assert_eq!(resolve_alignment(1 << 40), None);
    }

    #[test]
    fn item_size_pads_up_to_alignment() {
        assert_eq!(padded_item_size(1, 8), Some(8));
        assert_eq!(padded_item_size(8, 8), Some(8));
        assert_eq!(padded_item_size(9, 8), Some(16));
        assert_eq!(padded_item_size(16, 8), Some(16));
        assert_eq!(padded_item_size(17, 16), Some(32));
    }

    #[test]
    fn zero_item_size_is_rejected() {
        assert_eq!(padded_item_size(0, 8), None);
    }

    #[test]
    fn overflowing_item_size_is_rejected() {
        assert_eq!(padded_item_size(usize::MAX, 8), None);
    }

    #[test]
    fn normalize_combines_both_steps() {
        let layout = BlockLayout::normalize(16, 8).unwrap();
        assert_eq!(layout.item_size(), 16.max(PTR));
        assert_eq!(layout.alignment(), 8.max(PTR));

        let layout = BlockLayout::normalize(3, 1).unwrap();
        assert_eq!(layout.item_size(), PTR);
        assert_eq!(layout.alignment(), PTR);
    }

    #[test]
    fn normalize_reports_bad_alignment() {
        let error = BlockLayout::normalize(16, 12).unwrap_err();
        assert!(matches!(error, Error::InvalidAlignment { requested: 12 }));
    }

    #[test]
    fn normalize_reports_bad_item_size() {
        let error = BlockLayout::normalize(0, 8).unwrap_err();
        assert!(matches!(error, Error::InvalidItemSize { item_size: 0, .. }));
    }
}
