use std::time::Duration;

use thiserror::Error;

use crate::ChunkState;

/// Errors that can occur when operating a [`ChunkPool`][crate::ChunkPool].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested alignment is not a power of two that the pool supports.
    #[error("invalid alignment {requested}: must be a power of two below 2^31")]
    InvalidAlignment {
        /// The alignment the pool was constructed with.
        requested: usize,
    },

    /// The requested item size is zero or cannot be padded to the alignment.
    #[error("invalid item size {item_size} for alignment {alignment}")]
    InvalidItemSize {
        /// The item size the pool was constructed with.
        item_size: usize,

        /// The resolved alignment the item size was padded to.
        alignment: usize,
    },

    /// The pool has already been created successfully.
    #[error("the pool has already been created")]
    AlreadyCreated,

    /// The operation needs a created pool but `create()` has not succeeded yet.
    #[error("the pool has not been created")]
    NotCreated,

    /// The bulk allocator could not provide memory for a growth batch.
    #[error("the bulk allocator could not provide {bytes} bytes")]
    AllocationFailed {
        /// Size of the region that was requested.
        bytes: usize,
    },

    /// An adopted buffer is too small to hold even a single block.
    #[error("a buffer of {byte_size} bytes cannot hold a single block of {item_size} bytes")]
    BufferTooSmall {
        /// Size of the buffer that was offered.
        byte_size: usize,

        /// Size of one block in the pool.
        item_size: usize,
    },

    /// A growth request asked for zero additional blocks.
    #[error("cannot grow the pool by zero blocks")]
    NothingToAdd,

    /// The pool lock could not be acquired before the timeout elapsed.
    #[error("could not acquire the pool lock within {timeout:?}")]
    LockTimeout {
        /// The budget the caller supplied.
        timeout: Duration,
    },

    /// No block became available before the timeout elapsed.
    #[error("no block became available within {timeout:?}")]
    Exhausted {
        /// The budget the caller supplied.
        timeout: Duration,
    },

    /// The address does not belong to a block currently in use from this pool.
    ///
    /// This is always a bug in the caller: freeing a block twice, freeing a block in a different
    /// pool or freeing an address that never came from a pool.
    #[error("address {address:#x} is not a block in use from this pool")]
    NotFound {
        /// The address the caller tried to free.
        address: usize,
    },

    /// The chunk index is out of range.
    #[error("chunk {index} does not exist in a pool of {chunk_count} chunks")]
    InvalidChunk {
        /// The index the caller asked for.
        index: usize,

        /// Number of chunks in the pool at the time of the call.
        chunk_count: usize,
    },

    /// The chunk is in a state that does not allow the requested transition.
    #[error("chunk {index} is {state:?} and cannot change state")]
    StateConflict {
        /// The index of the chunk.
        index: usize,

        /// The state the chunk was in when the deadline passed.
        state: ChunkState,
    },

    /// The block was allocated as owner-only and the calling thread is not its owner.
    ///
    /// The block stays in use. Only the thread that allocated it can free it.
    #[error("chunk {index} can only be freed by the thread that allocated it")]
    NotOwner {
        /// The index of the chunk.
        index: usize,
    },

    /// The chunk's guard bytes were damaged and the pool quarantined it instead of healing it.
    #[error("chunk {index} failed its guard check and has been blocked")]
    Corrupted {
        /// The index of the quarantined chunk.
        index: usize,
    },
}

impl Error {
    /// Whether the error means the caller's time budget ran out.
    ///
    /// Such errors are transient. Retrying with a fresh budget may succeed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Exhausted { .. })
    }

    /// Whether the error means the pool's configuration or lifecycle was violated.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidAlignment { .. }
                | Self::InvalidItemSize { .. }
                | Self::AlreadyCreated
                | Self::NotCreated
        )
    }
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn timeouts_are_classified() {
        assert!(
            Error::LockTimeout {
                timeout: Duration::ZERO
            }
            .is_timeout()
        );
        assert!(
            Error::Exhausted {
                timeout: Duration::from_millis(5)
            }
            .is_timeout()
        );
        assert!(!Error::NotCreated.is_timeout());
    }

    #[test]
    fn config_errors_are_classified() {
        assert!(Error::InvalidAlignment { requested: 3 }.is_config());
        assert!(Error::AlreadyCreated.is_config());
        assert!(!Error::NothingToAdd.is_config());
        assert!(!Error::NotFound { address: 0 }.is_config());
    }

    #[test]
    fn messages_mention_details() {
        let message = Error::BufferTooSmall {
            byte_size: 7,
            item_size: 16,
        }
        .to_string();

        assert!(message.contains('7'));
        assert!(message.contains("16"));

        let message = Error::NotFound { address: 0x1000 }.to_string();
        assert!(message.contains("0x1000"));

        let message = Error::NotOwner { index: 12 }.to_string();
        assert!(message.contains("12"));
    }

    #[test]
    fn ownership_violation_is_neither_timeout_nor_config() {
        let error = Error::NotOwner { index: 0 };

        assert!(!error.is_timeout());
        assert!(!error.is_config());
    }
}
