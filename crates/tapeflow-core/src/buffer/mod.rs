use std::sync::Arc;

use crate::core::queue::BlockingQueue;

pub mod pool;

pub use pool::{BlockFailure, MemoryBlock, MemoryBlockPool, PoolMetricsSnapshot};

/// Ordered block stream of a single file, from its producer to its consumer.
pub type BlockFifo = Arc<BlockingQueue<MemoryBlock>>;
