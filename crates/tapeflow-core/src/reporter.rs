use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::core::queue::BlockingQueue;
use crate::core::sync::panic_details;
use crate::error::TapeflowError;
use crate::proxy::TapedProxy;
use crate::types::{Result, SessionState, VolumeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReporterEvent {
    State(SessionState),
    TapeMounted,
    TapeUnmounted,
}

/// Forwards session lifecycle events to the supervising process from its
/// own thread, so the tape thread never blocks on the supervisor.
pub struct TapeServerReporter {
    events: Arc<BlockingQueue<Option<ReporterEvent>>>,
    finished: Arc<AtomicBool>,
    proxy: Arc<dyn TapedProxy>,
    volume: VolumeInfo,
    thread: Option<JoinHandle<usize>>,
}

/// Cloneable producer side of a [`TapeServerReporter`].
#[derive(Clone)]
pub struct ReporterHandle {
    events: Arc<BlockingQueue<Option<ReporterEvent>>>,
    finished: Arc<AtomicBool>,
}

impl ReporterHandle {
    pub fn report_state(&self, state: SessionState) {
        self.push(ReporterEvent::State(state));
    }

    pub fn tape_mounted(&self) {
        self.push(ReporterEvent::TapeMounted);
    }

    pub fn tape_unmounted(&self) {
        self.push(ReporterEvent::TapeUnmounted);
    }

    /// Ends the event stream. Later events are dropped; repeated calls are
    /// harmless.
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.events.push(None);
        }
    }

    fn push(&self, event: ReporterEvent) {
        if self.finished.load(Ordering::Acquire) {
            tracing::warn!(?event, "lifecycle event after reporter finished; dropped");
            return;
        }
        self.events.push(Some(event));
    }
}

impl TapeServerReporter {
    pub fn new(proxy: Arc<dyn TapedProxy>, volume: VolumeInfo) -> Self {
        Self {
            events: Arc::new(BlockingQueue::new()),
            finished: Arc::new(AtomicBool::new(false)),
            proxy,
            volume,
            thread: None,
        }
    }

    pub fn handle(&self) -> ReporterHandle {
        ReporterHandle {
            events: Arc::clone(&self.events),
            finished: Arc::clone(&self.finished),
        }
    }

    pub fn start_threads(&mut self) {
        let events = Arc::clone(&self.events);
        let proxy = Arc::clone(&self.proxy);
        let volume = self.volume.clone();
        self.thread = Some(thread::spawn(move || {
            let mut delivered = 0usize;
            while let Some(event) = events.pop() {
                match event {
                    ReporterEvent::State(state) => {
                        proxy.report_state(state, volume.session_type, &volume.vid)
                    }
                    ReporterEvent::TapeMounted => {
                        proxy.tape_mounted(volume.session_type, &volume.vid, &volume.drive_unit)
                    }
                    ReporterEvent::TapeUnmounted => {
                        proxy.tape_unmounted(&volume.vid, &volume.drive_unit)
                    }
                }
                delivered += 1;
            }
            tracing::debug!(delivered, "tape server reporter finished");
            delivered
        }));
    }

    /// Joins the reporter thread and returns the number of events delivered.
    pub fn wait_threads(&mut self) -> Result<usize> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|payload| {
                TapeflowError::Other(anyhow::anyhow!(
                    "reporter thread panicked: {}",
                    panic_details(payload.as_ref())
                ))
            }),
            None => Ok(0),
        }
    }
}
