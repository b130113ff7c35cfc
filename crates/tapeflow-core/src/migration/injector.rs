use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};

use crate::config::SessionConfig;
use crate::core::queue::BlockingQueue;
use crate::core::sync::{SessionFault, panic_details};
use crate::core::worker_pool::TaskSink;
use crate::error::TapeflowError;
use crate::injection::{InjectorHandle, TaskQueue, run_injection_loop};
use crate::migration::BlockCredits;
use crate::migration::disk_read::{DiskReadTask, DiskReadThreadPool};
use crate::migration::tape_write::{TapeWriteSingleThread, TapeWriteTask};
use crate::types::{MigrationFile, Result};

/// Where migration work comes from.
pub trait MigrationJobSource: Send {
    /// Returns up to `max_files` files totalling at most `max_bytes`, with
    /// consecutive destination fseqs. An empty batch means nothing is left.
    fn next_batch(&mut self, max_files: u64, max_bytes: u64) -> Result<Vec<MigrationFile>>;
}

struct MigrationInjection {
    source: Box<dyn MigrationJobSource>,
    tape_tasks: TaskQueue<TapeWriteTask>,
    disk_sink: TaskSink<DiskReadTask>,
    cancel: Arc<AtomicBool>,
    credits_per_file: usize,
    max_files: u64,
    max_bytes: u64,
    first_fseq: Option<u64>,
    injected: usize,
}

impl MigrationInjection {
    fn fetch(&mut self) -> Result<bool> {
        let files = self
            .source
            .next_batch(self.max_files, self.max_bytes)
            .map_err(|err| TapeflowError::Injector(err.to_string()))?;
        if files.is_empty() {
            return Ok(false);
        }
        tracing::info!(files = files.len(), "injecting migration tasks");
        for file in files {
            self.first_fseq.get_or_insert(file.fseq);
            let fifo = Arc::new(BlockingQueue::new());
            let credits = Arc::new(BlockCredits::new(self.credits_per_file));
            self.tape_tasks.push(Some(TapeWriteTask::new(
                file.clone(),
                Arc::clone(&fifo),
                Arc::clone(&credits),
            )));
            self.disk_sink.push(DiskReadTask::new(
                file,
                fifo,
                credits,
                Arc::clone(&self.cancel),
            ));
            self.injected += 1;
        }
        Ok(true)
    }

    fn signal_end(&self) {
        self.tape_tasks.push(None);
        self.disk_sink.finish();
    }
}

/// Feeds the tape write thread and the disk read pool from a
/// [`MigrationJobSource`].
pub struct MigrationTaskInjector {
    handle: InjectorHandle,
    fault: Arc<SessionFault>,
    injection: Option<MigrationInjection>,
    first_fseq: Option<u64>,
    thread: Option<JoinHandle<usize>>,
}

impl MigrationTaskInjector {
    pub fn new(
        source: Box<dyn MigrationJobSource>,
        tape: &TapeWriteSingleThread,
        disk: &DiskReadThreadPool,
        fault: Arc<SessionFault>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            handle: InjectorHandle::new(),
            fault,
            injection: Some(MigrationInjection {
                source,
                tape_tasks: tape.task_queue(),
                disk_sink: disk.task_sink(),
                cancel: tape.cancel_flag(),
                credits_per_file: config.migration_credits_per_file(),
                max_files: config.max_files_request,
                max_bytes: config.max_bytes_request,
                first_fseq: None,
                injected: 0,
            }),
            first_fseq: None,
            thread: None,
        }
    }

    pub fn handle(&self) -> InjectorHandle {
        self.handle.clone()
    }

    /// Injects the first batch before any thread runs. `Ok(false)` means
    /// there is nothing to migrate.
    pub fn synchronous_injection(&mut self) -> Result<bool> {
        let injection = self.injection.as_mut().ok_or_else(|| {
            TapeflowError::Injector("migration injector already started".to_string())
        })?;
        let injected = injection.fetch()?;
        self.first_fseq = injection.first_fseq;
        Ok(injected)
    }

    /// Destination fseq of the first injected file.
    pub fn first_fseq_to_write(&self) -> Option<u64> {
        self.first_fseq
    }

    pub fn start_threads(&mut self) {
        let Some(mut injection) = self.injection.take() else {
            tracing::warn!("migration injector already started");
            return;
        };
        let handle = self.handle.clone();
        let fault = Arc::clone(&self.fault);
        self.thread = Some(thread::spawn(move || {
            run_injection_loop("migration", &handle, &fault, || injection.fetch());
            injection.signal_end();
            tracing::info!(injected = injection.injected, "migration injector finished");
            injection.injected
        }));
    }

    /// Joins the injector and returns how many files it injected.
    pub fn wait_threads(&mut self) -> Result<usize> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|payload| {
                TapeflowError::Other(anyhow::anyhow!(
                    "migration injector thread panicked: {}",
                    panic_details(payload.as_ref())
                ))
            }),
            None => Ok(0),
        }
    }
}
