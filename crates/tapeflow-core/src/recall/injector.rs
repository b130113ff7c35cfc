use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::SessionConfig;
use crate::core::queue::BlockingQueue;
use crate::core::sync::{SessionFault, panic_details};
use crate::core::worker_pool::TaskSink;
use crate::error::TapeflowError;
use crate::injection::{InjectorHandle, TaskQueue, run_injection_loop};
use crate::recall::disk_write::{DiskWriteTask, DiskWriteThreadPool};
use crate::recall::tape_read::{TapeReadSingleThread, TapeReadTask};
use crate::types::{RecallFile, Result};

/// Where recall work comes from, usually the client that requested the
/// session.
pub trait RecallJobSource: Send {
    /// Returns up to `max_files` files totalling at most `max_bytes`, in tape
    /// order. An empty batch means nothing is left for now.
    fn next_batch(&mut self, max_files: u64, max_bytes: u64) -> Result<Vec<RecallFile>>;
}

struct RecallInjection {
    source: Box<dyn RecallJobSource>,
    tape_tasks: TaskQueue<TapeReadTask>,
    disk_sink: TaskSink<DiskWriteTask>,
    max_files: u64,
    max_bytes: u64,
    injected: usize,
}

impl RecallInjection {
    /// Pulls one batch and hands each file to both sides. The disk task is
    /// queued before the tape task so a writer is ready for its blocks.
    fn fetch(&mut self) -> Result<bool> {
        let files = self
            .source
            .next_batch(self.max_files, self.max_bytes)
            .map_err(|err| TapeflowError::Injector(err.to_string()))?;
        if files.is_empty() {
            return Ok(false);
        }
        tracing::info!(files = files.len(), "injecting recall tasks");
        for file in files {
            let fifo = Arc::new(BlockingQueue::new());
            self.disk_sink
                .push(DiskWriteTask::new(file.clone(), Arc::clone(&fifo)));
            self.tape_tasks.push(Some(TapeReadTask::new(file, fifo)));
            self.injected += 1;
        }
        Ok(true)
    }

    fn signal_end(&self) {
        self.tape_tasks.push(None);
        self.disk_sink.finish();
    }
}

/// Feeds the tape read thread and the disk write pool from a
/// [`RecallJobSource`], one batch per request.
pub struct RecallTaskInjector {
    handle: InjectorHandle,
    fault: Arc<SessionFault>,
    injection: Option<RecallInjection>,
    thread: Option<JoinHandle<usize>>,
}

impl RecallTaskInjector {
    pub fn new(
        source: Box<dyn RecallJobSource>,
        tape: &TapeReadSingleThread,
        disk: &DiskWriteThreadPool,
        fault: Arc<SessionFault>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            handle: InjectorHandle::new(),
            fault,
            injection: Some(RecallInjection {
                source,
                tape_tasks: tape.task_queue(),
                disk_sink: disk.task_sink(),
                max_files: config.max_files_request,
                max_bytes: config.max_bytes_request,
                injected: 0,
            }),
            thread: None,
        }
    }

    pub fn handle(&self) -> InjectorHandle {
        self.handle.clone()
    }

    /// Fetches the first batch before any thread runs. `Ok(false)` means
    /// there is nothing to recall.
    pub fn synchronous_fetch(&mut self) -> Result<bool> {
        let injection = self
            .injection
            .as_mut()
            .ok_or_else(|| TapeflowError::Injector("recall injector already started".to_string()))?;
        injection.fetch()
    }

    pub fn start_threads(&mut self) {
        let Some(mut injection) = self.injection.take() else {
            tracing::warn!("recall injector already started");
            return;
        };
        let handle = self.handle.clone();
        let fault = Arc::clone(&self.fault);
        self.thread = Some(thread::spawn(move || {
            run_injection_loop("recall", &handle, &fault, || injection.fetch());
            injection.signal_end();
            tracing::info!(injected = injection.injected, "recall injector finished");
            injection.injected
        }));
    }

    /// Joins the injector and returns how many files it injected.
    pub fn wait_threads(&mut self) -> Result<usize> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|payload| {
                TapeflowError::Other(anyhow::anyhow!(
                    "recall injector thread panicked: {}",
                    panic_details(payload.as_ref())
                ))
            }),
            None => Ok(0),
        }
    }
}
