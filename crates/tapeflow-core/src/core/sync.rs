use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::TapeflowError;
use crate::types::Result;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// First session-fatal error seen by any thread of a session.
///
/// Only the first recorded fault is kept; later ones are logged by their
/// reporters and otherwise dropped.
#[derive(Debug, Default)]
pub struct SessionFault {
    fault: Mutex<Option<(String, i32)>>,
}

impl SessionFault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the fault unless one was already recorded. Returns true if
    /// this call won.
    pub fn record(&self, message: impl Into<String>, code: i32) -> bool {
        let mut fault = lock_unpoisoned(&self.fault);
        if fault.is_some() {
            return false;
        }
        *fault = Some((message.into(), code));
        true
    }

    pub fn record_error(&self, error: &TapeflowError) -> bool {
        self.record(error.to_string(), error.error_code())
    }

    pub fn is_set(&self) -> bool {
        lock_unpoisoned(&self.fault).is_some()
    }

    pub fn get(&self) -> Option<(String, i32)> {
        lock_unpoisoned(&self.fault).clone()
    }
}

/// One-shot latch: once set it stays set and releases every waiter.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock_unpoisoned(&self.done) = true;
        self.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *lock_unpoisoned(&self.done)
    }

    pub fn wait(&self) {
        let mut done = lock_unpoisoned(&self.done);
        while !*done {
            done = match self.condvar.wait(done) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Turns a thread panic payload into a printable message.
pub(crate) fn panic_details(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `f`, turning a panic into the error built by `into_error` from a
/// "`what` panicked" message.
pub(crate) fn catch_panic<T, F>(
    what: &str,
    f: F,
    into_error: fn(String) -> TapeflowError,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(into_error(format!(
            "{what} panicked: {}",
            panic_details(payload.as_ref())
        )))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn first_fault_wins() {
        let fault = SessionFault::new();
        assert!(fault.record("drive died", 5));
        assert!(!fault.record("second", 6));
        assert_eq!(fault.get(), Some(("drive died".to_string(), 5)));
    }

    #[test]
    fn latch_releases_waiters() {
        let latch = Arc::new(CompletionLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.set();
        assert!(waiter.join().is_ok());
        assert!(latch.is_set());
    }

    #[test]
    fn panics_become_errors() {
        let outcome: Result<u8> =
            catch_panic("disk write", || panic!("bad sector"), TapeflowError::Client);
        match outcome {
            Err(TapeflowError::Client(message)) => {
                assert_eq!(message, "disk write panicked: bad sector");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(catch_panic("noop", || Ok(3), TapeflowError::Client).ok(), Some(3));
    }
}
