#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A thread-safe pool of fixed-size memory blocks.
//!
//! This crate provides [`ChunkPool`], which hands out blocks of one size from memory obtained in
//! bulk. It is meant for code that allocates and frees many same-sized buffers and wants that to
//! be cheap, bounded in time and checked for corruption.
//!
//! # Key Features
//!
//! - **Fixed-size blocks**: Every block has the same size, padded to a power-of-two alignment
//! - **Timed acquisition**: Every blocking operation takes a timeout, covering both lock
//!   acquisition and waiting for a block to become free
//! - **Corruption guards**: Each chunk carries sentinel bytes that are verified on release, with a
//!   configurable [`CorruptionPolicy`]
//! - **Incremental growth**: Add blocks from the bulk allocator or adopt caller-provided buffers,
//!   without disturbing blocks already in use
//! - **Administrative quarantine**: Block and unblock individual chunks by index
//! - **Zeroed blocks**: Blocks are wiped on release, so every allocation starts with zero bytes
//! - **Pluggable collaborators**: Supply your own [`BulkAllocator`] or [`Clock`]
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use chunk_pool::{ChunkPool, FreeStatus};
//! use new_zealand::nz;
//!
//! const TIMEOUT: Duration = Duration::from_millis(50);
//!
//! let pool = ChunkPool::builder().item_size(128).element_count(nz!(4)).build();
//! pool.create(TIMEOUT).unwrap();
//!
//! let block = pool.allocate(TIMEOUT).unwrap();
//! assert_eq!(block.len(), 128);
//! assert_eq!(pool.get_used(), 1);
//!
//! // Grow the pool while blocks are in use.
//! pool.add_memory(4, TIMEOUT).unwrap();
//! assert_eq!(pool.chunk_count(), 8);
//!
//! assert_eq!(pool.free(block, TIMEOUT).unwrap(), FreeStatus::Clean);
//! assert_eq!(pool.get_free(), 8);
//! ```
//!
//! # Logging
//!
//! The pool emits `tracing` events: `debug` for creation, growth and state changes, `trace` for
//! every allocation and release, and `warn` whenever damaged guard bytes are detected. The crate
//! never installs a subscriber.

mod allocator;
mod builder;
mod chunk;
mod clock;
mod deadline;
mod error;
mod guard;
mod handle;
mod info;
mod layout;
mod policy;
mod pool;
mod table;

pub use allocator::*;
pub use builder::*;
pub use chunk::*;
pub use clock::*;
pub(crate) use deadline::*;
pub use error::*;
pub(crate) use guard::*;
pub use handle::*;
pub use info::*;
pub(crate) use layout::*;
pub use policy::*;
pub use pool::*;
pub(crate) use table::*;
