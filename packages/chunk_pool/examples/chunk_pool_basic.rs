//! Basic usage example for `ChunkPool`.
//!
//! This example creates a small pool, shares it between a few worker threads that each borrow
//! blocks for a while, grows the pool once it runs dry and finally prints the pool statistics.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chunk_pool::{ChunkPool, CorruptionPolicy};
use new_zealand::nz;

const TIMEOUT: Duration = Duration::from_millis(500);

fn main() {
    let pool = Arc::new(
        ChunkPool::builder()
            .item_size(256)
            .element_count(nz!(4))
            .alignment(64)
            .corruption_policy(CorruptionPolicy::Heal)
            .build(),
    );

    pool.create(TIMEOUT).unwrap();

    println!(
        "Created pool: {} blocks of {} bytes, aligned to {}",
        pool.chunk_count(),
        pool.item_size().unwrap(),
        pool.alignment().unwrap()
    );

    let workers: Vec<_> = (0..3_u8)
        .map(|worker| {
            let pool = Arc::clone(&pool);

            thread::spawn(move || {
                let block = pool.allocate(TIMEOUT).expect("pool has enough blocks");

                // SAFETY: We hold the block until we free it below and nobody else touches it.
                let bytes =
                    unsafe { std::slice::from_raw_parts_mut(block.ptr().as_ptr(), block.len()) };
                bytes.fill(worker);

                thread::sleep(Duration::from_millis(10));

                pool.free(block, TIMEOUT).unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // Take every block, then show that an exhausted pool times out.
    let held: Vec<_> = std::iter::from_fn(|| pool.allocate(Duration::ZERO)).collect();
    println!("Holding {} blocks", held.len());

    match pool.try_allocate(Duration::from_millis(10)) {
        Ok(_) => println!("Unexpectedly got another block"),
        Err(error) => println!("Pool is exhausted: {error}"),
    }

    pool.add_memory(4, TIMEOUT).unwrap();
    println!("Grew the pool to {} blocks", pool.chunk_count());

    for block in held {
        pool.free(block, TIMEOUT).unwrap();
    }

    let stats = pool.stats();
    println!(
        "Final stats: {} used, {} free, {} blocked, {} of {} bytes free",
        stats.used(),
        stats.free(),
        stats.blocked(),
        stats.free_bytes(),
        stats.capacity_bytes()
    );
}
