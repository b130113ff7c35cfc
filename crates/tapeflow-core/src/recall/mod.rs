//! Recall: files move from tape to disk.
//!
//! One tape thread reads files in tape order into per-file block FIFOs;
//! the disk write pool drains each FIFO into its destination file.

pub mod disk_write;
pub mod injector;
pub mod tape_read;

pub use disk_write::{DiskWriteTask, DiskWriteThreadPool};
pub use injector::{RecallJobSource, RecallTaskInjector};
pub use tape_read::{TapeReadSingleThread, TapeReadTask};
