pub mod queue;
pub mod sync;
pub mod worker_pool;

pub use queue::{BlockingQueue, ValueRemaining};
pub use sync::{CompletionLatch, SessionFault};
pub use worker_pool::{PoolRuntimeSnapshot, TaskSink, WorkerPool, WorkerRuntimeSnapshot};
