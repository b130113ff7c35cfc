use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tapeflow_core::{MemoryBlockPool, TapeflowError};

#[test]
fn blocks_are_conserved_across_acquire_and_release() -> Result<(), Box<dyn std::error::Error>> {
    let pool = MemoryBlockPool::new(128, 4)?;
    assert_eq!(pool.free_blocks(), 4);

    let held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
    assert_eq!(pool.free_blocks(), 1);
    assert_eq!(pool.blocks_in_use(), 3);

    for block in held {
        pool.release(block);
    }
    assert_eq!(pool.free_blocks(), 4);

    let metrics = pool.metrics();
    assert_eq!(metrics.acquired, 3);
    assert_eq!(metrics.released, 3);
    assert_eq!(metrics.waited, 0);
    Ok(())
}

#[test]
fn recycled_blocks_come_back_clean() -> Result<(), Box<dyn std::error::Error>> {
    let pool = MemoryBlockPool::new(16, 1)?;
    {
        let mut block = pool.acquire();
        block.set_identity(9, 3, 2);
        assert_eq!(block.append(b"0123456789abcdefXYZ"), 16);
        block.mark_failed("bad sector", 5);
        block.mark_cancelled();
        block.mark_last();
    }

    let block = pool.acquire();
    assert!(block.is_empty());
    assert_eq!(block.block_size(), 16);
    assert!(block.failure().is_none());
    assert!(!block.is_cancelled());
    assert!(!block.is_last());
    assert_eq!(block.index(), 0);
    Ok(())
}

#[test]
fn blocked_acquire_wakes_on_release() -> Result<(), Box<dyn std::error::Error>> {
    let pool = Arc::new(MemoryBlockPool::new(64, 1)?);
    let held = pool.acquire();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let started = Instant::now();
            let block = pool.acquire();
            (started.elapsed(), block.block_size())
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());
    drop(held);

    let (waited, block_size) = waiter.join().map_err(|_| "waiter panicked")?;
    assert!(waited >= Duration::from_millis(25));
    assert_eq!(block_size, 64);
    assert_eq!(pool.free_blocks(), 1);
    assert_eq!(pool.metrics().waited, 1);
    Ok(())
}

#[test]
fn impossible_allocation_is_reported_not_aborted() {
    let result = MemoryBlockPool::new(usize::MAX / 2 + 1, 2);
    assert!(matches!(result, Err(TapeflowError::OutOfMemory { .. })));
}

#[test]
fn zero_sized_pool_is_rejected() {
    assert!(matches!(
        MemoryBlockPool::new(0, 4),
        Err(TapeflowError::InvalidConfig(_))
    ));
    assert!(matches!(
        MemoryBlockPool::new(64, 0),
        Err(TapeflowError::InvalidConfig(_))
    ));
}

#[test]
fn more_tasks_than_blocks_still_finish() -> Result<(), Box<dyn std::error::Error>> {
    const BLOCKS: usize = 4;
    let pool = Arc::new(MemoryBlockPool::new(32, BLOCKS)?);
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let workers: Vec<_> = (0..=BLOCKS)
        .map(|id| {
            let pool = Arc::clone(&pool);
            let done = done_tx.clone();
            thread::spawn(move || {
                for round in 0..20u8 {
                    let mut block = pool.acquire();
                    block.append(&[id as u8, round]);
                    thread::sleep(Duration::from_micros(200));
                }
                let _ = done.send(id);
            })
        })
        .collect();
    drop(done_tx);

    let mut finished = 0;
    while finished <= BLOCKS {
        done_rx.recv_timeout(Duration::from_secs(10))?;
        finished += 1;
    }
    for worker in workers {
        worker.join().map_err(|_| "worker panicked")?;
    }
    assert_eq!(pool.free_blocks(), BLOCKS);
    assert_eq!(pool.metrics().acquired, (BLOCKS + 1) * 20);
    Ok(())
}
