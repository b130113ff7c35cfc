use std::sync::Arc;
use std::time::Instant;

use crate::buffer::BlockFifo;
use crate::checksum::{Checksum, ChecksumAlgo};
use crate::core::sync::{CompletionLatch, SessionFault};
use crate::core::worker_pool::{PoolRuntimeSnapshot, TaskSink, WorkerPool};
use crate::disk::{DiskFileFactory, DiskFileWriter, abort_writer, disk_call};
use crate::error::TapeflowError;
use crate::report::ReportSender;
use crate::stats::{DiskStats, StageTimer};
use crate::telemetry::worker::WorkerTelemetry;
use crate::types::{FileFailure, FileReport, RecallFile, Result};

/// Drains one file's blocks into its destination on disk.
pub struct DiskWriteTask {
    file: RecallFile,
    fifo: BlockFifo,
}

impl DiskWriteTask {
    pub fn new(file: RecallFile, fifo: BlockFifo) -> Self {
        Self { file, fifo }
    }

    pub fn file(&self) -> &RecallFile {
        &self.file
    }

    /// Consumes every block of the file, up to and including the last one,
    /// then reports the outcome. Returns whether the file made it to disk.
    ///
    /// Blocks keep being drained after a failure, a panicking disk back-end
    /// included, so they all go back to the pool.
    pub(crate) fn execute(
        self,
        disk: &dyn DiskFileFactory,
        reports: &ReportSender,
        stats: &mut DiskStats,
    ) -> bool {
        let started_at = Instant::now();
        let mut timer = StageTimer::new();
        let mut writer: Option<Box<dyn DiskFileWriter>> = None;
        let mut checksum = Checksum::new(self.file.checksum_algo);
        let mut written = 0u64;
        let mut failure: Option<FileFailure> = None;

        loop {
            let block = self.fifo.pop();
            stats.wait_data_time += timer.lap();
            let last = block.is_last();
            if failure.is_none() {
                if let Some(block_failure) = block.failure() {
                    failure = Some(FileFailure {
                        file_id: self.file.file_id,
                        fseq: self.file.fseq,
                        message: block_failure.message.clone(),
                        code: block_failure.code,
                    });
                } else {
                    let wrote = disk_call("disk write", || {
                        self.write_block(disk, &mut writer, block.payload(), stats, &mut timer)
                    });
                    match wrote {
                        Ok(()) => {
                            checksum.update(block.payload());
                            stats.checksum_time += timer.lap();
                            written += block.len() as u64;
                        }
                        Err(err) => failure = Some(self.failure(&err)),
                    }
                }
            }
            drop(block);
            if last {
                break;
            }
        }

        let outcome = match failure {
            Some(failure) => {
                if let Some(writer) = writer {
                    abort_writer(writer);
                }
                Err(failure)
            }
            None => disk_call("disk close", || {
                self.close(writer, written, checksum.finalize(), stats, &mut timer)
            })
            .map_err(|err| self.failure(&err)),
        };
        stats.transfer_time += started_at.elapsed();

        match outcome {
            Ok(value) => {
                stats.files_count += 1;
                stats.data_volume += written;
                tracing::debug!(
                    file_id = self.file.file_id,
                    fseq = self.file.fseq,
                    bytes = written,
                    "file written to disk"
                );
                reports.report_completed_job(FileReport {
                    file_id: self.file.file_id,
                    fseq: self.file.fseq,
                    size: written,
                    checksum_algo: self.file.checksum_algo,
                    checksum: value,
                });
                true
            }
            Err(failure) => {
                stats.failed_files += 1;
                tracing::warn!(
                    file_id = failure.file_id,
                    fseq = failure.fseq,
                    code = failure.code,
                    message = %failure.message,
                    path = %self.file.disk_path.display(),
                    "recalled file not written to disk"
                );
                reports.report_failed_job(failure);
                false
            }
        }
    }

    fn write_block(
        &self,
        disk: &dyn DiskFileFactory,
        writer: &mut Option<Box<dyn DiskFileWriter>>,
        data: &[u8],
        stats: &mut DiskStats,
        timer: &mut StageTimer,
    ) -> Result<()> {
        let writer = match writer {
            Some(writer) => writer,
            None => {
                let opened = disk.create_writer(&self.file.disk_path, self.file.size)?;
                stats.open_time += timer.lap();
                writer.insert(opened)
            }
        };
        if !data.is_empty() {
            writer.write(data)?;
        }
        stats.read_write_time += timer.lap();
        Ok(())
    }

    /// Verifies size and checksum, then makes the file durable. The partial
    /// file is removed if anything is off.
    fn close(
        &self,
        writer: Option<Box<dyn DiskFileWriter>>,
        written: u64,
        actual: u32,
        stats: &mut DiskStats,
        timer: &mut StageTimer,
    ) -> Result<u32> {
        let writer = writer
            .ok_or_else(|| TapeflowError::Drive("file ended before its first block".to_string()))?;
        if written != self.file.size {
            abort_writer(writer);
            return Err(TapeflowError::SizeMismatch {
                expected: self.file.size,
                actual: written,
            });
        }
        let expected = self
            .file
            .expected_checksum
            .filter(|_| self.file.checksum_algo != ChecksumAlgo::None);
        if let Some(expected) = expected.filter(|expected| *expected != actual) {
            abort_writer(writer);
            return Err(TapeflowError::ChecksumMismatch { expected, actual });
        }
        writer.close()?;
        stats.close_time += timer.lap();
        Ok(actual)
    }

    fn failure(&self, error: &TapeflowError) -> FileFailure {
        FileFailure::from_error(self.file.file_id, self.file.fseq, error)
    }
}

const POOL_NAME: &str = "disk write pool";

/// Disk side of a recall: a fixed set of workers writing files to disk in
/// whatever order they finish.
///
/// The last worker to exit closes the session's report stream. With a tape
/// latch set it first waits for the tape thread to be done, so tape-side
/// reports always precede the end of session.
pub struct DiskWriteThreadPool {
    pool: WorkerPool<DiskWriteTask>,
    disk: Arc<dyn DiskFileFactory>,
    reports: ReportSender,
    fault: Arc<SessionFault>,
    tape_done: Option<Arc<CompletionLatch>>,
}

impl DiskWriteThreadPool {
    pub fn new(
        num_workers: usize,
        disk: Arc<dyn DiskFileFactory>,
        reports: ReportSender,
        fault: Arc<SessionFault>,
        telemetry: Arc<dyn WorkerTelemetry>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(POOL_NAME, "disk_write", num_workers, telemetry),
            disk,
            reports,
            fault,
            tape_done: None,
        }
    }

    pub fn with_tape_latch(mut self, tape_done: Arc<CompletionLatch>) -> Self {
        self.tape_done = Some(tape_done);
        self
    }

    pub fn task_sink(&self) -> TaskSink<DiskWriteTask> {
        self.pool.sink()
    }

    pub fn push(&self, task: DiskWriteTask) {
        self.pool.sink().push(task);
    }

    /// No more tasks will be pushed.
    pub fn finish(&self) {
        self.pool.sink().finish();
    }

    pub fn start_threads(&mut self) {
        let disk = Arc::clone(&self.disk);
        let reports = self.reports.clone();
        let end_reports = self.reports.clone();
        let fault = Arc::clone(&self.fault);
        let tape_done = self.tape_done.clone();
        tracing::info!(workers = self.pool.num_workers(), "starting disk write threads");

        self.pool.start(
            move |_worker_id, task: DiskWriteTask, stats| {
                task.execute(disk.as_ref(), &reports, stats)
            },
            |_remaining| {},
            move |totals| {
                if let Some(latch) = tape_done {
                    latch.wait();
                }
                log_totals(totals);
                match fault.get() {
                    Some((message, code)) => {
                        end_reports.report_end_of_session_with_errors(message, code)
                    }
                    None => end_reports.report_end_of_session(),
                }
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

fn log_totals(totals: &DiskStats) {
    tracing::info!(
        pool = POOL_NAME,
        files = totals.files_count,
        failed = totals.failed_files,
        bytes = totals.data_volume,
        open_secs = totals.open_time.as_secs_f64(),
        write_secs = totals.read_write_time.as_secs_f64(),
        checksum_secs = totals.checksum_time.as_secs_f64(),
        wait_data_secs = totals.wait_data_time.as_secs_f64(),
        close_secs = totals.close_time.as_secs_f64(),
        throughput_bps = totals.throughput(),
        "all disk write threads finished"
    );
}
