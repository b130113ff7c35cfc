use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::buffer::{BlockFifo, MemoryBlockPool};
use crate::config::SessionConfig;
use crate::core::queue::{BlockingQueue, ValueRemaining};
use crate::core::sync::{CompletionLatch, panic_details};
use crate::error::TapeflowError;
use crate::injection::{InjectorHandle, TaskQueue, request_more_if_low};
use crate::tape::{SessionChannels, TapeContext, TapeEndpoints, TapeThreadOutcome, guarded};
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{RecallFile, Result};

/// Reads one file from tape into its block FIFO.
pub struct TapeReadTask {
    file: RecallFile,
    fifo: BlockFifo,
    finished: bool,
}

impl TapeReadTask {
    pub fn new(file: RecallFile, fifo: BlockFifo) -> Self {
        Self {
            file,
            fifo,
            finished: false,
        }
    }

    pub fn file(&self) -> &RecallFile {
        &self.file
    }

    /// Positions on the file and streams its blocks to the FIFO, the last
    /// one flagged.
    ///
    /// A size mismatch is carried to the disk side on the last block and
    /// returned; it only fails this file. Drive errors end the session and
    /// the caller then [`abandon`](Self::abandon)s the file.
    pub(crate) fn execute(&mut self, ctx: &mut TapeContext, pool: &MemoryBlockPool) -> Result<()> {
        let (file_id, fseq, size) = (self.file.file_id, self.file.fseq, self.file.size);
        ctx.watchdog.notify_begin_new_job(file_id, fseq);
        ctx.timer.lap();

        ctx.set_stage("Error_tapePositionForRead");
        ctx.drive
            .position_for_read(fseq, self.file.block_id)
            .map_err(|err| err.with_context(format!("positioning for fseq {fseq}")))?;
        ctx.stats.position_time += ctx.timer.lap();

        ctx.set_stage("Error_tapeReadData");
        let mut total = 0u64;
        let mut index = 0u64;
        let mut mismatch = None;
        loop {
            let mut block = pool.acquire();
            ctx.stats.wait_free_memory_time += ctx.timer.lap();
            block.set_identity(file_id, fseq, index);
            index += 1;

            let capacity = block.block_size();
            let read = ctx
                .drive
                .read_block(block.payload_mut(capacity))
                .map_err(|err| err.with_context(format!("reading fseq {fseq}")))?;
            block.truncate(read);
            ctx.stats.read_write_time += ctx.timer.lap();
            total += read as u64;
            ctx.watchdog.notify(read as u64);

            let done = read == 0 || total >= size;
            if done {
                if total != size {
                    let err = TapeflowError::SizeMismatch {
                        expected: size,
                        actual: total,
                    };
                    block.mark_failed_with(&err);
                    mismatch = Some(err);
                } else {
                    ctx.stats.files_count += 1;
                }
                block.mark_last();
                self.finished = true;
            }
            self.fifo.push(block);
            if done {
                break;
            }
        }

        ctx.stats.data_volume += total;
        ctx.watchdog.file_finished();
        telemetry::increment_counter(
            tags::METRIC_TAPE_FILE_COUNT,
            1,
            &[("subsystem", "tape"), ("op", "read")],
        );
        telemetry::increment_counter(
            tags::METRIC_TAPE_BYTES,
            total,
            &[("subsystem", "tape"), ("op", "read")],
        );
        tracing::debug!(file_id, fseq, bytes = total, blocks = index, "file read from tape");
        mismatch.map_or(Ok(()), Err)
    }

    /// Ends the file's block stream with a failed last block, unless its
    /// last block already went out. Returns whether anything was pushed.
    pub(crate) fn abandon(&mut self, pool: &MemoryBlockPool, error: &TapeflowError) -> bool {
        if self.finished {
            return false;
        }
        let mut block = pool.acquire();
        block.set_identity(self.file.file_id, self.file.fseq, 0);
        block.mark_failed_with(error);
        block.mark_last();
        self.fifo.push(block);
        self.finished = true;
        true
    }
}

fn count_failed_file(ctx: &mut TapeContext) {
    ctx.stats.failed_files += 1;
    telemetry::increment_counter(
        tags::METRIC_TAPE_FILE_FAIL_COUNT,
        1,
        &[("subsystem", "tape"), ("op", "read")],
    );
}

/// The one thread allowed to touch the drive during a recall.
///
/// Tasks arrive in tape order from the injector. When the queue runs low
/// the thread asks the injector for more; a `None` task ends the session.
pub struct TapeReadSingleThread {
    tasks: TaskQueue<TapeReadTask>,
    worker: Option<TapeReadWorker>,
    thread: Option<JoinHandle<TapeThreadOutcome>>,
}

struct TapeReadWorker {
    ctx: TapeContext,
    tasks: TaskQueue<TapeReadTask>,
    current: Option<TapeReadTask>,
    pool: Arc<MemoryBlockPool>,
    injector: Option<InjectorHandle>,
    max_files: u64,
    tape_done: Arc<CompletionLatch>,
}

impl TapeReadSingleThread {
    pub fn new(
        endpoints: TapeEndpoints,
        channels: SessionChannels,
        config: &SessionConfig,
        pool: Arc<MemoryBlockPool>,
        tape_done: Arc<CompletionLatch>,
    ) -> Self {
        let tasks: TaskQueue<TapeReadTask> = Arc::new(BlockingQueue::new());
        Self {
            worker: Some(TapeReadWorker {
                ctx: TapeContext::new(endpoints, channels, config),
                tasks: Arc::clone(&tasks),
                current: None,
                pool,
                injector: None,
                max_files: config.max_files_request,
                tape_done,
            }),
            tasks,
            thread: None,
        }
    }

    pub fn task_queue(&self) -> TaskQueue<TapeReadTask> {
        Arc::clone(&self.tasks)
    }

    pub fn push(&self, task: TapeReadTask) {
        self.tasks.push(Some(task));
    }

    /// No more tasks will be pushed.
    pub fn finish(&self) {
        self.tasks.push(None);
    }

    /// Hooks up the injector asked for more work as the queue drains.
    pub fn set_task_injector(&mut self, injector: InjectorHandle) {
        if let Some(worker) = self.worker.as_mut() {
            worker.injector = Some(injector);
        }
    }

    pub fn start_threads(&mut self) {
        let Some(worker) = self.worker.take() else {
            tracing::warn!("tape read thread already started");
            return;
        };
        self.thread = Some(thread::spawn(move || worker.run()));
    }

    pub fn wait_threads(&mut self) -> Result<TapeThreadOutcome> {
        let handle = self
            .thread
            .take()
            .ok_or_else(|| TapeflowError::Drive("tape read thread was never started".to_string()))?;
        handle.join().map_err(|payload| {
            TapeflowError::Other(anyhow::anyhow!(
                "tape read thread panicked: {}",
                panic_details(payload.as_ref())
            ))
        })
    }
}

impl TapeReadWorker {
    fn run(mut self) -> TapeThreadOutcome {
        tracing::info!(vid = %self.ctx.volume.vid, "tape read thread started");
        let error = guarded("tape read thread", || self.transfer()).err();

        if let Some(err) = &error {
            tracing::error!(
                vid = %self.ctx.volume.vid,
                error = %err,
                "recall aborted by a tape error"
            );
            self.ctx.count_stage_error();
            self.ctx.fault.record_error(err);
            if let Some(injector) = &self.injector {
                injector.set_error_flag();
                injector.finish();
            }
        }
        let end_action = self.ctx.cleanup(error.as_ref());
        if let Some(err) = &error {
            self.abandon_remaining(err);
        }
        self.tape_done.set();

        TapeThreadOutcome {
            end_action,
            stats: self.ctx.finish_stats(),
            error: error.map(|err| err.to_string()),
        }
    }

    fn transfer(&mut self) -> Result<()> {
        self.ctx.mount_and_check(false)?;
        self.ctx.log_tape_alerts();
        self.ctx.start_transfer();

        loop {
            let ValueRemaining { value, remaining } = self.tasks.pop_with_remaining();
            request_more_if_low(self.injector.as_ref(), remaining, self.max_files);
            self.ctx.stats.wait_instructions_time += self.ctx.timer.lap();
            let Some(task) = value else {
                tracing::info!(vid = %self.ctx.volume.vid, "no more files to read from tape");
                return Ok(());
            };
            let task = self.current.insert(task);
            if let Err(err) = task.execute(&mut self.ctx, &self.pool) {
                if err.is_session_fatal() {
                    self.ctx.watchdog.update_stats(&self.ctx.stats);
                    return Err(err);
                }
                tracing::warn!(
                    file_id = task.file().file_id,
                    fseq = task.file().fseq,
                    error = %err,
                    "file failed, moving on to the next one"
                );
                task.abandon(&self.pool, &err);
                count_failed_file(&mut self.ctx);
            }
            self.ctx.watchdog.update_stats(&self.ctx.stats);
            self.current = None;
        }
    }

    /// Fails the file being read when the error hit, then every task still
    /// queued up to the end marker.
    fn abandon_remaining(&mut self, error: &TapeflowError) {
        let mut abandoned = 0usize;
        let in_flight = self.current.take().into_iter();
        let queued = std::iter::from_fn(|| self.tasks.pop());
        for mut task in in_flight.chain(queued) {
            if task.abandon(&self.pool, error) {
                count_failed_file(&mut self.ctx);
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            tracing::warn!(vid = %self.ctx.volume.vid, abandoned, "files failed after tape error");
        }
    }
}
