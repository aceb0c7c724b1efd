//! Integration tests for the `chunk_pool` package.
//!
//! These exercise `ChunkPool` through its public API only, including sharing one pool between
//! threads, growing it while blocks are in use and waiting for blocks to come back.

use std::collections::HashSet;
use std::slice;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chunk_pool::{BlockHandle, ChunkPool, ChunkState, Error, FreeStatus};

const TIMEOUT: Duration = Duration::from_secs(10);
const SHORT: Duration = Duration::from_millis(20);

fn bytes_of(handle: BlockHandle) -> &'static mut [u8] {
    // SAFETY: Test code only touches blocks it holds, while the pool that owns them is alive.
    unsafe { slice::from_raw_parts_mut(handle.ptr().as_ptr(), handle.len()) }
}

fn assert_counts_add_up(pool: &ChunkPool) {
    let stats = pool.stats();
    let item_size = pool.item_size().unwrap();

    assert_eq!(
        stats.used() + stats.free() + stats.blocked(),
        pool.size() / item_size
    );
}

#[test]
fn four_block_walkthrough() {
    let pool = ChunkPool::new(16, 4, 8);
    pool.create(TIMEOUT).unwrap();

    assert_eq!(pool.size(), 64);
    assert_eq!(pool.get_free(), 4);

    let handles: Vec<_> = (0..4).map(|_| pool.allocate(TIMEOUT).unwrap()).collect();

    let distinct: HashSet<_> = handles.iter().map(BlockHandle::ptr).collect();
    assert_eq!(distinct.len(), 4);

    assert!(pool.allocate(SHORT).is_none());

    for handle in &handles {
        bytes_of(*handle).fill(0x5a);
    }

    let first = handles[0];
    assert_eq!(pool.free(first, TIMEOUT).unwrap(), FreeStatus::Clean);
    assert_eq!(pool.get_free(), 1);

    let again = pool.allocate(TIMEOUT).unwrap();
    assert_eq!(again.ptr(), first.ptr());
    assert_eq!(bytes_of(again), &[0_u8; 16]);

    assert_counts_add_up(&pool);
}

#[test]
fn concurrent_allocations_never_share_a_block() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let pool = Arc::new(ChunkPool::new(32, 4, 8));
    pool.create(TIMEOUT).unwrap();

    let outstanding = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let outstanding = Arc::clone(&outstanding);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                for _ in 0..ROUNDS {
                    let handle = pool.allocate(TIMEOUT).unwrap();
                    let address = handle.ptr().addr().get();

                    assert!(
                        outstanding.lock().unwrap().insert(address),
                        "block {address:#x} handed out twice"
                    );

                    // Holders own the bytes exclusively, so this pattern must survive untouched.
                    let tag = u8::try_from(worker).unwrap();
                    bytes_of(handle).fill(tag);
                    thread::yield_now();
                    assert!(bytes_of(handle).iter().all(|b| *b == tag));

                    assert!(outstanding.lock().unwrap().remove(&address));
                    pool.free(handle, TIMEOUT).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pool.get_used(), 0);
    assert_eq!(pool.get_free(), 4);
    assert_counts_add_up(&pool);
}

#[test]
fn waiting_allocation_is_served_by_free() {
    let pool = Arc::new(ChunkPool::new(16, 1, 8));
    pool.create(TIMEOUT).unwrap();

    let held = pool.allocate(TIMEOUT).unwrap();

    let waiter = thread::spawn({
        let pool = Arc::clone(&pool);
        move || pool.allocate(TIMEOUT)
    });

    thread::sleep(Duration::from_millis(50));
    pool.free(held, TIMEOUT).unwrap();

    let handle = waiter.join().unwrap().expect("waiter should receive the freed block");
    assert_eq!(handle.ptr(), held.ptr());
}

#[test]
fn waiting_allocation_is_served_by_growth() {
    let pool = Arc::new(ChunkPool::new(16, 1, 8));
    pool.create(TIMEOUT).unwrap();

    let _held = pool.allocate(TIMEOUT).unwrap();

    let waiter = thread::spawn({
        let pool = Arc::clone(&pool);
        move || pool.allocate(TIMEOUT)
    });

    thread::sleep(Duration::from_millis(50));
    pool.add_memory(2, TIMEOUT).unwrap();

    let handle = waiter.join().unwrap().expect("waiter should receive a new block");
    assert_eq!(handle.index(), 1);
}

#[test]
fn growth_adds_exactly_requested_blocks() {
    let pool = ChunkPool::new(24, 3, 8);
    pool.create(TIMEOUT).unwrap();

    let held = pool.allocate(TIMEOUT).unwrap();
    bytes_of(held).fill(0x77);

    let free_before = pool.get_free();
    pool.add_memory(5, TIMEOUT).unwrap();

    assert_eq!(pool.get_free(), free_before + 5);
    assert_eq!(pool.chunk_count(), 8);

    // The held block is unaffected by growth.
    assert!(bytes_of(held).iter().all(|b| *b == 0x77));
    assert_eq!(pool.get_state(held.index()), Some(ChunkState::Used));
    assert_eq!(pool.free(held, TIMEOUT).unwrap(), FreeStatus::Clean);

    assert_counts_add_up(&pool);
}

#[test]
fn blocked_chunk_is_never_allocated() {
    let pool = ChunkPool::new(16, 3, 8);
    pool.create(TIMEOUT).unwrap();

    pool.set_blocked(1, true, TIMEOUT).unwrap();

    let a = pool.allocate(TIMEOUT).unwrap();
    let b = pool.allocate(TIMEOUT).unwrap();

    assert_eq!(a.index(), 0);
    assert_eq!(b.index(), 2);
    assert!(pool.allocate(SHORT).is_none());
    assert!(pool.is_empty());

    // A used chunk cannot be blocked.
    assert!(matches!(
        pool.set_blocked(0, true, SHORT),
        Err(Error::StateConflict { index: 0, .. })
    ));

    assert_counts_add_up(&pool);
}

#[test]
fn set_blocked_waits_for_release() {
    let pool = Arc::new(ChunkPool::new(16, 1, 8));
    pool.create(TIMEOUT).unwrap();

    let held = pool.allocate(TIMEOUT).unwrap();

    let blocker = thread::spawn({
        let pool = Arc::clone(&pool);
        move || pool.set_blocked(0, true, TIMEOUT)
    });

    thread::sleep(Duration::from_millis(50));
    pool.free(held, TIMEOUT).unwrap();

    blocker.join().unwrap().unwrap();
    assert_eq!(pool.get_state(0), Some(ChunkState::Blocked));
}

#[test]
fn exhausted_allocation_respects_timeout() {
    let pool = ChunkPool::new(16, 1, 8);
    pool.create(TIMEOUT).unwrap();

    let _held = pool.allocate(TIMEOUT).unwrap();

    let started = Instant::now();
    let error = pool.try_allocate(SHORT).unwrap_err();

    assert!(error.is_timeout());
    assert!(started.elapsed() >= SHORT);
    assert!(started.elapsed() < TIMEOUT);
}

#[test]
fn adopted_buffer_serves_allocations() {
    let pool = ChunkPool::new(16, 1, 16);
    pool.create(TIMEOUT).unwrap();

    let _initial = pool.allocate(TIMEOUT).unwrap();
    assert!(pool.allocate(Duration::ZERO).is_none());

    let buffer = Box::leak(vec![0xcc_u8; 64].into_boxed_slice());
    let added = pool.add_memory_from(buffer, TIMEOUT).unwrap();
    assert!(added >= 3);

    let adopted = pool.allocate(TIMEOUT).unwrap();
    assert_eq!(adopted.index(), 1);
    assert_eq!(adopted.ptr().as_ptr().align_offset(16), 0);
    assert!(bytes_of(adopted).iter().all(|b| *b == 0));

    assert_counts_add_up(&pool);
}

#[test]
fn zero_timeout_still_succeeds_on_idle_pool() {
    let pool = ChunkPool::new(16, 2, 8);
    pool.create(Duration::ZERO).unwrap();

    let handle = pool.allocate(Duration::ZERO).unwrap();
    pool.free(handle, Duration::ZERO).unwrap();
    pool.add_memory(1, Duration::ZERO).unwrap();

    assert_eq!(pool.chunk_count(), 3);
}

#[test]
fn unbounded_timeout_is_accepted() {
    let pool = ChunkPool::new(16, 1, 8);
    pool.create(Duration::MAX).unwrap();

    let handle = pool.allocate(Duration::MAX).unwrap();
    pool.free(handle, Duration::MAX).unwrap();
}

#[test]
fn owned_block_is_only_freed_by_its_thread() {
    let pool = Arc::new(ChunkPool::new(16, 2, 8));
    pool.create(TIMEOUT).unwrap();

    let owned = pool.allocate_owned(TIMEOUT).unwrap();
    let shared = pool.allocate(TIMEOUT).unwrap();

    let results = thread::spawn({
        let pool = Arc::clone(&pool);
        move || (pool.free(owned, TIMEOUT), pool.free(shared, TIMEOUT))
    })
    .join()
    .unwrap();

    assert!(matches!(results.0, Err(Error::NotOwner { .. })));
    assert_eq!(results.1.unwrap(), FreeStatus::Clean);

    assert_eq!(pool.get_state(owned.index()), Some(ChunkState::Used));
    assert_eq!(pool.free(owned, TIMEOUT).unwrap(), FreeStatus::Clean);

    assert_counts_add_up(&pool);
}
