use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::buffer::{BlockFifo, MemoryBlock};
use crate::checksum::Checksum;
use crate::config::SessionConfig;
use crate::core::queue::BlockingQueue;
use crate::core::sync::panic_details;
use crate::error::{ENOSPC, TapeflowError};
use crate::injection::{InjectorHandle, TaskQueue};
use crate::migration::BlockCredits;
use crate::tape::{SessionChannels, TapeContext, TapeEndpoints, TapeThreadOutcome, guarded};
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{FileFailure, FileReport, MigrationFile, Result};

/// A block taken off a file's FIFO; its credit goes back to the disk
/// reader when it is dropped.
struct CreditedBlock<'a> {
    block: MemoryBlock,
    credits: &'a BlockCredits,
}

impl<'a> CreditedBlock<'a> {
    fn pop(fifo: &BlockFifo, credits: &'a BlockCredits) -> Self {
        Self {
            block: fifo.pop(),
            credits,
        }
    }
}

impl Deref for CreditedBlock<'_> {
    type Target = MemoryBlock;

    fn deref(&self) -> &MemoryBlock {
        &self.block
    }
}

impl Drop for CreditedBlock<'_> {
    fn drop(&mut self) {
        self.credits.give_back();
    }
}

/// Appends one file to the tape from its block FIFO.
pub struct TapeWriteTask {
    file: MigrationFile,
    fifo: BlockFifo,
    credits: Arc<BlockCredits>,
    drained: bool,
    reported: bool,
}

impl TapeWriteTask {
    pub fn new(file: MigrationFile, fifo: BlockFifo, credits: Arc<BlockCredits>) -> Self {
        Self {
            file,
            fifo,
            credits,
            drained: false,
            reported: false,
        }
    }

    pub fn file(&self) -> &MigrationFile {
        &self.file
    }

    pub fn fseq(&self) -> u64 {
        self.file.fseq
    }

    /// Writes the file and reports it.
    ///
    /// A file whose disk read failed still gets its tape file closed so the
    /// next fseq lands where expected; only that file is reported failed.
    /// Drive errors are returned and end the session; the caller then
    /// [`settle`](Self::settle)s the task.
    pub(crate) fn execute(&mut self, ctx: &mut TapeContext) -> Result<()> {
        let (file_id, fseq, size, algo) = (
            self.file.file_id,
            self.file.fseq,
            self.file.size,
            self.file.checksum_algo,
        );
        ctx.watchdog.notify_begin_new_job(file_id, fseq);
        ctx.timer.lap();

        ctx.set_stage("Error_tapeWriteHeader");
        ctx.drive
            .start_file(fseq)
            .map_err(|err| err.with_context(format!("starting fseq {fseq}")))?;
        ctx.stats.position_time += ctx.timer.lap();

        ctx.set_stage("Error_tapeWriteData");
        let mut checksum = Checksum::new(algo);
        let mut written = 0u64;
        let mut failure: Option<FileFailure> = None;
        while !self.drained {
            let block = CreditedBlock::pop(&self.fifo, &self.credits);
            ctx.stats.wait_data_time += ctx.timer.lap();
            self.drained = block.is_last();
            if failure.is_some() {
                continue;
            }
            if let Some(block_failure) = block.failure() {
                failure = Some(FileFailure {
                    file_id,
                    fseq,
                    message: block_failure.message.clone(),
                    code: block_failure.code,
                });
            } else if !block.is_empty() {
                ctx.drive
                    .write_block(block.payload())
                    .map_err(|err| err.with_context(format!("writing fseq {fseq}")))?;
                ctx.stats.read_write_time += ctx.timer.lap();
                checksum.update(block.payload());
                ctx.stats.checksum_time += ctx.timer.lap();
                written += block.len() as u64;
                ctx.watchdog.notify(block.len() as u64);
            }
        }

        ctx.set_stage("Error_tapeWriteTrailer");
        ctx.drive
            .close_file()
            .map_err(|err| err.with_context(format!("closing fseq {fseq}")))?;
        ctx.stats.read_write_time += ctx.timer.lap();
        ctx.watchdog.file_finished();

        if failure.is_none() && written != size {
            failure = Some(FileFailure::from_error(
                file_id,
                fseq,
                &TapeflowError::SizeMismatch {
                    expected: size,
                    actual: written,
                },
            ));
        }
        self.reported = true;
        match failure {
            None => {
                ctx.stats.files_count += 1;
                ctx.stats.data_volume += written;
                telemetry::increment_counter(
                    tags::METRIC_TAPE_FILE_COUNT,
                    1,
                    &[("subsystem", "tape"), ("op", "write")],
                );
                telemetry::increment_counter(
                    tags::METRIC_TAPE_BYTES,
                    written,
                    &[("subsystem", "tape"), ("op", "write")],
                );
                ctx.reports.report_completed_job(FileReport {
                    file_id,
                    fseq,
                    size: written,
                    checksum_algo: algo,
                    checksum: checksum.finalize(),
                });
            }
            Some(failure) => {
                tracing::warn!(
                    file_id,
                    fseq,
                    message = %failure.message,
                    "file written to tape without its disk data"
                );
                ctx.stats.failed_files += 1;
                ctx.reports.report_failed_job(failure);
            }
        }
        Ok(())
    }

    /// Finishes a task the session gave up on: recycles whatever blocks are
    /// left in its FIFO and reports the file failed if nothing was reported
    /// yet.
    pub(crate) fn settle(&mut self, ctx: &mut TapeContext, error: &TapeflowError) {
        while !self.drained {
            let block = CreditedBlock::pop(&self.fifo, &self.credits);
            self.drained = block.is_last();
        }
        if self.reported {
            return;
        }
        self.reported = true;
        ctx.stats.failed_files += 1;
        telemetry::increment_counter(
            tags::METRIC_TAPE_FILE_FAIL_COUNT,
            1,
            &[("subsystem", "tape"), ("op", "write")],
        );
        ctx.reports
            .report_failed_job(FileFailure::from_error(self.file.file_id, self.file.fseq, error));
    }
}

/// The one thread allowed to touch the drive during a migration.
///
/// Files are appended in strict fseq order right after `last_fseq`. The
/// drive is flushed every `files_before_flush` files or
/// `bytes_before_flush` bytes, and after the last file; each flush lets
/// the packer report the files written so far.
pub struct TapeWriteSingleThread {
    tasks: TaskQueue<TapeWriteTask>,
    cancel: Arc<AtomicBool>,
    worker: Option<TapeWriteWorker>,
    thread: Option<JoinHandle<TapeThreadOutcome>>,
}

struct TapeWriteWorker {
    ctx: TapeContext,
    tasks: TaskQueue<TapeWriteTask>,
    current: Option<TapeWriteTask>,
    cancel: Arc<AtomicBool>,
    injector: Option<InjectorHandle>,
    last_fseq: u64,
    files_before_flush: u64,
    bytes_before_flush: u64,
}

impl TapeWriteSingleThread {
    pub fn new(
        endpoints: TapeEndpoints,
        channels: SessionChannels,
        config: &SessionConfig,
    ) -> Self {
        let tasks: TaskQueue<TapeWriteTask> = Arc::new(BlockingQueue::new());
        let cancel = Arc::new(AtomicBool::new(false));
        Self {
            worker: Some(TapeWriteWorker {
                ctx: TapeContext::new(endpoints, channels, config),
                tasks: Arc::clone(&tasks),
                current: None,
                cancel: Arc::clone(&cancel),
                injector: None,
                last_fseq: 0,
                files_before_flush: config.files_before_flush,
                bytes_before_flush: config.bytes_before_flush,
            }),
            tasks,
            cancel,
            thread: None,
        }
    }

    pub fn task_queue(&self) -> TaskQueue<TapeWriteTask> {
        Arc::clone(&self.tasks)
    }

    /// Raised when the thread gives up, so disk readers stop early.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The fseq of the last file already on tape; writing starts after it.
    pub fn set_last_fseq(&mut self, last_fseq: u64) {
        if let Some(worker) = self.worker.as_mut() {
            worker.last_fseq = last_fseq;
        }
    }

    pub fn push(&self, task: TapeWriteTask) {
        self.tasks.push(Some(task));
    }

    /// No more tasks will be pushed.
    pub fn finish(&self) {
        self.tasks.push(None);
    }

    pub fn set_task_injector(&mut self, injector: InjectorHandle) {
        if let Some(worker) = self.worker.as_mut() {
            worker.injector = Some(injector);
        }
    }

    pub fn start_threads(&mut self) {
        let Some(worker) = self.worker.take() else {
            tracing::warn!("tape write thread already started");
            return;
        };
        self.thread = Some(thread::spawn(move || worker.run()));
    }

    pub fn wait_threads(&mut self) -> Result<TapeThreadOutcome> {
        let handle = self.thread.take().ok_or_else(|| {
            TapeflowError::Drive("tape write thread was never started".to_string())
        })?;
        handle.join().map_err(|payload| {
            TapeflowError::Other(anyhow::anyhow!(
                "tape write thread panicked: {}",
                panic_details(payload.as_ref())
            ))
        })
    }
}

impl TapeWriteWorker {
    fn run(mut self) -> TapeThreadOutcome {
        tracing::info!(
            vid = %self.ctx.volume.vid,
            last_fseq = self.last_fseq,
            "tape write thread started"
        );
        let error = guarded("tape write thread", || self.transfer()).err();

        if let Some(err) = &error {
            self.cancel.store(true, Ordering::Release);
            self.ctx.fault.record_error(err);
            if err.is_end_of_tape() {
                tracing::info!(vid = %self.ctx.volume.vid, "tape is full; ending migration");
                self.ctx.watchdog.set_error_count("Info_tapeFilledUp", 1);
                self.ctx.reports.report_tape_full();
            } else {
                tracing::error!(
                    vid = %self.ctx.volume.vid,
                    error = %err,
                    "migration aborted by a tape error"
                );
                self.ctx.count_stage_error();
            }
            if let Some(injector) = &self.injector {
                injector.set_error_flag();
                injector.finish();
            }
        }
        let end_action = self.ctx.cleanup(error.as_ref());

        match &error {
            None => match self.ctx.fault.get() {
                Some((message, code)) => self
                    .ctx
                    .reports
                    .report_end_of_session_with_errors(message, code),
                None => self.ctx.reports.report_end_of_session(),
            },
            Some(err) => {
                self.fail_remaining(err);
                let (message, code) = if err.is_end_of_tape() {
                    ("End of migration due to tape full".to_string(), ENOSPC)
                } else {
                    (err.to_string(), err.error_code())
                };
                self.ctx
                    .reports
                    .report_end_of_session_with_errors(message, code);
            }
        }

        TapeThreadOutcome {
            end_action,
            stats: self.ctx.finish_stats(),
            error: error.map(|err| err.to_string()),
        }
    }

    fn transfer(&mut self) -> Result<()> {
        self.ctx.mount_and_check(true)?;
        self.ctx.set_stage("Error_tapePositionForWrite");
        self.ctx.drive.position_for_write(self.last_fseq)?;
        self.ctx.stats.position_time += self.ctx.timer.lap();
        self.ctx.start_transfer();

        let mut files_since_flush = 0u64;
        let mut bytes_since_flush = 0u64;
        loop {
            let task = self.tasks.pop();
            self.ctx.stats.wait_instructions_time += self.ctx.timer.lap();
            let Some(task) = task else {
                return self.flush("no more files to write; final flush");
            };

            let task = self.current.insert(task);
            let expected = self.last_fseq + 1;
            if task.fseq() != expected {
                return Err(TapeflowError::FseqOutOfOrder {
                    expected,
                    actual: task.fseq(),
                });
            }

            let outcome = task.execute(&mut self.ctx);
            self.ctx.watchdog.update_stats(&self.ctx.stats);
            outcome?;
            self.last_fseq = task.fseq();
            files_since_flush += 1;
            bytes_since_flush += task.file().size;
            self.current = None;

            if files_since_flush >= self.files_before_flush
                || bytes_since_flush >= self.bytes_before_flush
            {
                self.flush("flush thresholds reached")?;
                files_since_flush = 0;
                bytes_since_flush = 0;
            }
        }
    }

    fn flush(&mut self, reason: &'static str) -> Result<()> {
        self.ctx.set_stage("Error_tapeFlush");
        let started_at = Instant::now();
        self.ctx.drive.flush()?;
        let elapsed = started_at.elapsed();
        self.ctx.stats.flush_time += self.ctx.timer.lap();
        self.ctx.stats.flush_count += 1;
        telemetry::increment_counter(
            tags::METRIC_TAPE_FLUSH_COUNT,
            1,
            &[("subsystem", "tape"), ("op", "flush")],
        );
        telemetry::record_histogram(
            tags::METRIC_TAPE_FLUSH_LATENCY_US,
            elapsed.as_micros().min(u64::MAX as u128) as u64,
            &[("subsystem", "tape"), ("op", "flush")],
        );
        tracing::info!(
            vid = %self.ctx.volume.vid,
            last_fseq = self.last_fseq,
            flush_secs = elapsed.as_secs_f64(),
            reason,
            "tape flushed"
        );
        self.ctx.reports.report_flush();
        Ok(())
    }

    /// Settles the file in flight when the error hit, then fails every
    /// task still queued up to the end marker.
    fn fail_remaining(&mut self, error: &TapeflowError) {
        if let Some(mut task) = self.current.take() {
            task.settle(&mut self.ctx, error);
        }
        let mut failed = 0usize;
        while let Some(mut task) = self.tasks.pop() {
            task.settle(&mut self.ctx, error);
            failed += 1;
        }
        if failed > 0 {
            tracing::warn!(
                vid = %self.ctx.volume.vid,
                failed,
                "queued files failed after tape error"
            );
        }
    }
}
