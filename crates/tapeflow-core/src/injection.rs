use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::queue::BlockingQueue;
use crate::core::sync::SessionFault;
use crate::types::Result;

/// Queue of tasks for a single tape thread; `None` ends the session.
pub type TaskQueue<T> = Arc<BlockingQueue<Option<T>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InjectionRequest {
    More { last_call: bool },
    End,
}

/// Lets the data threads ask an injector for more work or stop it.
#[derive(Clone)]
pub struct InjectorHandle {
    requests: Arc<BlockingQueue<InjectionRequest>>,
    error_flag: Arc<AtomicBool>,
}

impl InjectorHandle {
    pub(crate) fn new() -> Self {
        Self {
            requests: Arc::new(BlockingQueue::new()),
            error_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks for another batch. With `last_call` an empty answer ends the
    /// data movement.
    pub fn request_injection(&self, last_call: bool) {
        self.requests.push(InjectionRequest::More { last_call });
    }

    /// Ends the data movement regardless of outstanding work.
    pub fn finish(&self) {
        self.requests.push(InjectionRequest::End);
    }

    /// Stops further injection after a session-fatal error.
    pub fn set_error_flag(&self) {
        self.error_flag.store(true, Ordering::Release);
    }

    pub fn error_flag(&self) -> bool {
        self.error_flag.load(Ordering::Acquire)
    }

    pub(crate) fn requests(&self) -> &BlockingQueue<InjectionRequest> {
        &self.requests
    }
}

/// Asks for more work once the queue runs low: a regular request when it
/// drops to half the request size, a last call when it is empty.
pub(crate) fn request_more_if_low(
    injector: Option<&InjectorHandle>,
    remaining: usize,
    max_files: u64,
) {
    let Some(injector) = injector else {
        return;
    };
    if remaining == 0 {
        injector.request_injection(true);
    } else if (remaining as u64) + 1 == max_files / 2 {
        injector.request_injection(false);
    }
}

/// Serves injection requests until the data movement ends. The caller
/// signals the end to the data threads once this returns.
///
/// `fetch` pulls and injects one batch, returning whether anything was
/// injected.
pub(crate) fn run_injection_loop<F>(
    name: &'static str,
    handle: &InjectorHandle,
    fault: &SessionFault,
    mut fetch: F,
) where
    F: FnMut() -> Result<bool>,
{
    loop {
        match handle.requests().pop() {
            InjectionRequest::End => {
                tracing::debug!(injector = name, "end of data movement requested");
                break;
            }
            InjectionRequest::More { last_call } => {
                if handle.error_flag() {
                    tracing::info!(injector = name, "error flag set; no more injection");
                    break;
                }
                match fetch() {
                    Ok(true) => {}
                    Ok(false) if last_call => {
                        tracing::info!(injector = name, "no more files; ending data movement");
                        break;
                    }
                    Ok(false) => tracing::debug!(injector = name, "no files returned this time"),
                    Err(err) => {
                        tracing::error!(
                            injector = name,
                            error = %err,
                            "failed to fetch more files"
                        );
                        fault.record_error(&err);
                        break;
                    }
                }
            }
        }
    }
}
