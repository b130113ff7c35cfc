use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::error::TapeflowError;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::Result;

/// Fixed-size pool of memory blocks shared by the tape and disk threads.
///
/// All blocks are allocated when the pool is created; nothing is allocated
/// afterwards. A block is owned by exactly one party at a time (the pool,
/// a producer filling it, a file's FIFO, or a consumer draining it) and
/// goes back to the pool when the [`MemoryBlock`] handle is dropped.
///
/// # Example
/// ```
/// use tapeflow_core::MemoryBlockPool;
///
/// let pool = MemoryBlockPool::new(4096, 8).unwrap();
/// let block = pool.acquire();
/// assert_eq!(pool.free_blocks(), 7);
/// pool.release(block);
/// assert_eq!(pool.free_blocks(), 8);
/// ```
#[derive(Debug)]
pub struct MemoryBlockPool {
    recycler: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    block_size: usize,
    capacity: usize,
    metrics: Arc<PoolMetricsInner>,
}

impl MemoryBlockPool {
    /// Allocates `capacity` blocks of `block_size` bytes each.
    ///
    /// Fails with [`TapeflowError::OutOfMemory`] if the allocation cannot be
    /// satisfied, so a session can refuse to start instead of aborting.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self> {
        if block_size == 0 || capacity == 0 {
            return Err(TapeflowError::InvalidConfig(
                "memory block pool needs a non-zero block size and count".to_string(),
            ));
        }

        let requested = block_size.saturating_mul(capacity);
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            let mut payload = Vec::new();
            payload
                .try_reserve_exact(block_size)
                .map_err(|_| TapeflowError::OutOfMemory { requested })?;
            tx.try_send(payload).map_err(|_| {
                TapeflowError::Other(anyhow::anyhow!("memory block pool free list overflow"))
            })?;
        }

        telemetry::add_gauge(
            tags::METRIC_POOL_ALLOCATED_BYTES,
            requested as u64,
            &[("subsystem", "pool"), ("op", "allocate")],
        );

        Ok(Self {
            recycler: tx,
            receiver: rx,
            block_size,
            capacity,
            metrics: Arc::new(PoolMetricsInner::default()),
        })
    }

    /// Takes a block, blocking until one is free.
    pub fn acquire(&self) -> MemoryBlock {
        let started_at = Instant::now();
        let payload = match self.receiver.try_recv() {
            Ok(payload) => payload,
            Err(_) => {
                self.metrics.waited.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(
                    tags::METRIC_POOL_ACQUIRE_WAIT_COUNT,
                    1,
                    &[("subsystem", "pool"), ("op", "acquire"), ("result", "wait")],
                );
                // The pool keeps its own sender, so the channel cannot disconnect.
                self.receiver
                    .recv()
                    .unwrap_or_else(|_| Vec::with_capacity(self.block_size))
            }
        };
        let elapsed_us = started_at.elapsed().as_micros().min(u64::MAX as u128) as u64;
        telemetry::record_histogram(
            tags::METRIC_POOL_ACQUIRE_LATENCY_US,
            elapsed_us,
            &[("subsystem", "pool"), ("op", "acquire")],
        );
        self.wrap(payload)
    }

    /// Takes a block if one is free right now.
    pub fn try_acquire(&self) -> Option<MemoryBlock> {
        self.receiver
            .try_recv()
            .ok()
            .map(|payload| self.wrap(payload))
    }

    /// Takes a block, giving up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<MemoryBlock> {
        self.receiver
            .recv_timeout(timeout)
            .ok()
            .map(|payload| self.wrap(payload))
    }

    /// Returns a block to the pool, waking one blocked `acquire`.
    ///
    /// Dropping the block has the same effect.
    pub fn release(&self, block: MemoryBlock) {
        drop(block);
    }

    /// Blocks currently sitting in the pool.
    pub fn free_blocks(&self) -> usize {
        self.receiver.len()
    }

    /// Blocks currently held outside the pool.
    pub fn blocks_in_use(&self) -> usize {
        self.capacity.saturating_sub(self.free_blocks())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            acquired: self.metrics.acquired.load(Ordering::Relaxed),
            released: self.metrics.released.load(Ordering::Relaxed),
            waited: self.metrics.waited.load(Ordering::Relaxed),
        }
    }

    fn wrap(&self, mut payload: Vec<u8>) -> MemoryBlock {
        payload.clear();
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        telemetry::increment_counter(
            tags::METRIC_POOL_ACQUIRE_COUNT,
            1,
            &[("subsystem", "pool"), ("op", "acquire")],
        );
        MemoryBlock {
            payload,
            block_size: self.block_size,
            file_id: 0,
            fseq: 0,
            index: 0,
            failure: None,
            cancelled: false,
            last: false,
            recycler: self.recycler.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetricsSnapshot {
    /// Blocks handed out since creation.
    pub acquired: usize,
    /// Blocks returned since creation.
    pub released: usize,
    /// Acquisitions that had to wait for a release.
    pub waited: usize,
}

#[derive(Debug, Default)]
struct PoolMetricsInner {
    acquired: AtomicUsize,
    released: AtomicUsize,
    waited: AtomicUsize,
}

/// Why the data carried by a block cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    pub message: String,
    pub code: i32,
}

impl BlockFailure {
    pub fn to_error(&self) -> TapeflowError {
        TapeflowError::Other(anyhow::anyhow!("{} (code {})", self.message, self.code))
    }
}

/// A block borrowed from a [`MemoryBlockPool`], tagged with the file it
/// belongs to.
#[derive(Debug)]
pub struct MemoryBlock {
    payload: Vec<u8>,
    block_size: usize,
    file_id: u64,
    fseq: u64,
    index: u64,
    failure: Option<BlockFailure>,
    cancelled: bool,
    last: bool,
    recycler: Sender<Vec<u8>>,
    metrics: Arc<PoolMetricsInner>,
}

impl MemoryBlock {
    pub fn set_identity(&mut self, file_id: u64, fseq: u64, index: u64) {
        self.file_id = file_id;
        self.fseq = fseq;
        self.index = index;
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn fseq(&self) -> u64 {
        self.fseq
    }

    /// Position of this block within its file, starting at 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Resizes the payload to `len` bytes (clamped to the block size) and
    /// returns it for filling. Call [`MemoryBlock::truncate`] afterwards
    /// with the number of bytes actually written.
    pub fn payload_mut(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.block_size);
        self.payload.resize(len, 0);
        &mut self.payload
    }

    pub fn truncate(&mut self, len: usize) {
        self.payload.truncate(len);
    }

    /// Appends as much of `data` as fits and returns how many bytes were taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let room = self.block_size.saturating_sub(self.payload.len());
        let taken = room.min(data.len());
        self.payload.extend_from_slice(&data[..taken]);
        taken
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, code: i32) {
        self.failure = Some(BlockFailure {
            message: message.into(),
            code,
        });
    }

    pub fn mark_failed_with(&mut self, error: &TapeflowError) {
        self.mark_failed(error.to_string(), error.error_code());
    }

    pub fn failure(&self) -> Option<&BlockFailure> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Flags this block as the final one of its file.
    pub fn mark_last(&mut self) {
        self.last = true;
    }

    pub fn is_last(&self) -> bool {
        self.last
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        let payload = std::mem::take(&mut self.payload);
        // The channel is sized to the pool capacity, so this only fails
        // after the pool itself is gone.
        let _ = self.recycler.try_send(payload);
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        telemetry::increment_counter(
            tags::METRIC_POOL_RELEASE_COUNT,
            1,
            &[("subsystem", "pool"), ("op", "release")],
        );
    }
}
