use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::buffer::{BlockFifo, MemoryBlock, MemoryBlockPool};
use crate::core::worker_pool::{PoolRuntimeSnapshot, TaskSink, WorkerPool};
use crate::disk::{DiskFileFactory, DiskFileReader, disk_call};
use crate::error::TapeflowError;
use crate::injection::{InjectorHandle, request_more_if_low};
use crate::migration::BlockCredits;
use crate::stats::{DiskStats, StageTimer};
use crate::telemetry::worker::WorkerTelemetry;
use crate::types::{MigrationFile, Result};

/// Reads one file from disk into its block FIFO.
pub struct DiskReadTask {
    file: MigrationFile,
    fifo: BlockFifo,
    credits: Arc<BlockCredits>,
    cancel: Arc<AtomicBool>,
}

impl DiskReadTask {
    pub fn new(
        file: MigrationFile,
        fifo: BlockFifo,
        credits: Arc<BlockCredits>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            file,
            fifo,
            credits,
            cancel,
        }
    }

    pub fn file(&self) -> &MigrationFile {
        &self.file
    }

    /// Streams the file into its FIFO, then waits until the tape writer has
    /// consumed every block. Returns whether the whole file was read.
    ///
    /// On failure or cancellation, a panicking disk back-end included, the
    /// FIFO gets a flagged last block in place of the remaining data.
    pub(crate) fn execute(
        self,
        disk: &dyn DiskFileFactory,
        pool: &MemoryBlockPool,
        stats: &mut DiskStats,
    ) -> bool {
        let started_at = Instant::now();
        let mut timer = StageTimer::new();
        let mut index = 0u64;

        let read = disk_call("disk read", || {
            self.read_file(disk, pool, stats, &mut timer, &mut index)
        });
        let succeeded = match read {
            Ok(()) => {
                stats.files_count += 1;
                stats.data_volume += self.file.size;
                true
            }
            Err(err) => {
                let cancelled = matches!(err.root(), TapeflowError::Cancelled(_));
                if cancelled {
                    tracing::debug!(
                        file_id = self.file.file_id,
                        fseq = self.file.fseq,
                        "disk read cancelled"
                    );
                } else {
                    tracing::warn!(
                        file_id = self.file.file_id,
                        fseq = self.file.fseq,
                        path = %self.file.disk_path.display(),
                        error = %err,
                        "failed to read file for migration"
                    );
                }
                let credit = self.credits.hold();
                let mut block = self.next_block(pool, stats, &mut timer, &mut index);
                block.mark_failed_with(&err);
                if cancelled {
                    block.mark_cancelled();
                }
                block.mark_last();
                self.fifo.push(block);
                credit.hand_over();
                stats.failed_files += 1;
                false
            }
        };

        self.credits.wait_all_returned();
        stats.wait_data_time += timer.lap();
        stats.transfer_time += started_at.elapsed();
        succeeded
    }

    fn read_file(
        &self,
        disk: &dyn DiskFileFactory,
        pool: &MemoryBlockPool,
        stats: &mut DiskStats,
        timer: &mut StageTimer,
        index: &mut u64,
    ) -> Result<()> {
        let mut reader = disk.open_reader(&self.file.disk_path)?;
        stats.open_time += timer.lap();
        if reader.size() != self.file.size {
            return Err(TapeflowError::SizeMismatch {
                expected: self.file.size,
                actual: reader.size(),
            });
        }

        let mut remaining = self.file.size;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(TapeflowError::Cancelled(format!(
                    "migration of fseq {} aborted",
                    self.file.fseq
                )));
            }
            let credit = self.credits.hold();
            let mut block = self.next_block(pool, stats, timer, index);
            let wanted = remaining.min(block.block_size() as u64) as usize;
            fill_block(reader.as_mut(), &mut block, wanted).map_err(|err| {
                err.with_context(format!("reading {}", self.file.disk_path.display()))
            })?;
            stats.read_write_time += timer.lap();
            remaining -= wanted as u64;
            let last = remaining == 0;
            if last {
                block.mark_last();
            }
            self.fifo.push(block);
            credit.hand_over();
            if last {
                return Ok(());
            }
        }
    }

    fn next_block(
        &self,
        pool: &MemoryBlockPool,
        stats: &mut DiskStats,
        timer: &mut StageTimer,
        index: &mut u64,
    ) -> MemoryBlock {
        let mut block = pool.acquire();
        stats.wait_free_memory_time += timer.lap();
        block.set_identity(self.file.file_id, self.file.fseq, *index);
        *index += 1;
        block
    }
}

fn fill_block(
    reader: &mut dyn DiskFileReader,
    block: &mut MemoryBlock,
    wanted: usize,
) -> Result<()> {
    let buf = block.payload_mut(wanted);
    let mut filled = 0;
    while filled < wanted {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            return Err(TapeflowError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file ended after {filled} of {wanted} bytes of a block"),
            )));
        }
        filled += read;
    }
    Ok(())
}

const POOL_NAME: &str = "disk read pool";

/// Disk side of a migration: workers read files into memory blocks, asking
/// the injector for more work as their queue drains.
pub struct DiskReadThreadPool {
    pool: WorkerPool<DiskReadTask>,
    disk: Arc<dyn DiskFileFactory>,
    blocks: Arc<MemoryBlockPool>,
    injector: Option<InjectorHandle>,
    max_files: u64,
}

impl DiskReadThreadPool {
    pub fn new(
        num_workers: usize,
        disk: Arc<dyn DiskFileFactory>,
        blocks: Arc<MemoryBlockPool>,
        max_files: u64,
        telemetry: Arc<dyn WorkerTelemetry>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(POOL_NAME, "disk_read", num_workers, telemetry),
            disk,
            blocks,
            injector: None,
            max_files,
        }
    }

    pub fn set_task_injector(&mut self, injector: InjectorHandle) {
        self.injector = Some(injector);
    }

    pub fn task_sink(&self) -> TaskSink<DiskReadTask> {
        self.pool.sink()
    }

    pub fn push(&self, task: DiskReadTask) {
        self.pool.sink().push(task);
    }

    /// No more tasks will be pushed.
    pub fn finish(&self) {
        self.pool.sink().finish();
    }

    pub fn start_threads(&mut self) {
        let disk = Arc::clone(&self.disk);
        let blocks = Arc::clone(&self.blocks);
        let injector = self.injector.clone();
        let max_files = self.max_files;
        tracing::info!(workers = self.pool.num_workers(), "starting disk read threads");

        self.pool.start(
            move |_worker_id, task: DiskReadTask, stats| {
                task.execute(disk.as_ref(), &blocks, stats)
            },
            move |remaining| request_more_if_low(injector.as_ref(), remaining, max_files),
            |totals| {
                tracing::info!(
                    pool = POOL_NAME,
                    files = totals.files_count,
                    failed = totals.failed_files,
                    bytes = totals.data_volume,
                    open_secs = totals.open_time.as_secs_f64(),
                    read_secs = totals.read_write_time.as_secs_f64(),
                    wait_free_memory_secs = totals.wait_free_memory_time.as_secs_f64(),
                    wait_tape_secs = totals.wait_data_time.as_secs_f64(),
                    throughput_bps = totals.throughput(),
                    "all disk read threads finished"
                );
            },
        );
    }

    pub fn wait_threads(&mut self) -> Result<DiskStats> {
        self.pool.wait()
    }

    pub fn runtime_snapshot(&self) -> PoolRuntimeSnapshot {
        self.pool.runtime_snapshot()
    }
}
