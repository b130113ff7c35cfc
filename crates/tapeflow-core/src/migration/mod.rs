//! Migration: files move from disk to tape.
//!
//! The disk read pool fills per-file block FIFOs in parallel; the single
//! tape write thread appends files to the tape strictly in fseq order.

use crate::core::queue::BlockingQueue;

pub mod disk_read;
pub mod injector;
pub mod tape_write;

pub use disk_read::{DiskReadTask, DiskReadThreadPool};
pub use injector::{MigrationJobSource, MigrationTaskInjector};
pub use tape_write::{TapeWriteSingleThread, TapeWriteTask};

/// Caps the blocks one file may have in flight between its disk reader
/// and the tape writer.
///
/// The reader takes a credit before each block and the tape writer gives
/// it back once the block is written, so files queued behind the one on
/// tape can never take every block in the pool.
#[derive(Debug)]
pub struct BlockCredits {
    tokens: BlockingQueue<()>,
    total: usize,
}

impl BlockCredits {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        let tokens = BlockingQueue::new();
        for _ in 0..total {
            tokens.push(());
        }
        Self { tokens, total }
    }

    /// Blocks until a credit is free.
    pub fn take(&self) {
        self.tokens.pop();
    }

    pub fn give_back(&self) {
        self.tokens.push(());
    }

    /// Takes a credit that goes back on drop unless it is
    /// [handed over](CreditHold::hand_over) with its block.
    pub fn hold(&self) -> CreditHold<'_> {
        self.take();
        CreditHold {
            credits: self,
            armed: true,
        }
    }

    pub fn available(&self) -> usize {
        self.tokens.len()
    }

    /// Blocks until every credit has come back, i.e. the tape writer has
    /// consumed all blocks of the file.
    pub fn wait_all_returned(&self) {
        for _ in 0..self.total {
            self.tokens.pop();
        }
        for _ in 0..self.total {
            self.tokens.push(());
        }
    }
}

/// A credit taken for a block still being filled.
pub struct CreditHold<'a> {
    credits: &'a BlockCredits,
    armed: bool,
}

impl CreditHold<'_> {
    /// The block went into the FIFO; the tape writer returns the credit.
    pub fn hand_over(mut self) {
        self.armed = false;
    }
}

impl Drop for CreditHold<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.credits.give_back();
        }
    }
}
