//! The client that requested the session and receives per-file outcomes.

use std::time::Duration;

use crate::types::{DriveStatus, FileFailure, FileReport, Result};

/// Outbound reporting channel to the requesting client.
///
/// Every call carries the timeout the implementation must honour; a call
/// that cannot complete in time should fail with
/// [`crate::TapeflowError::Timeout`].
pub trait ClientReporter: Send {
    fn report_success(&mut self, files: &[FileReport], timeout: Duration) -> Result<()>;
    fn report_failure(&mut self, files: &[FileFailure], timeout: Duration) -> Result<()>;
    fn report_end_of_session(&mut self, timeout: Duration) -> Result<()>;
    fn report_end_of_session_with_error(
        &mut self,
        message: &str,
        code: i32,
        timeout: Duration,
    ) -> Result<()>;

    fn report_drive_status(
        &mut self,
        _status: DriveStatus,
        _reason: Option<&str>,
        _timeout: Duration,
    ) -> Result<()> {
        Ok(())
    }

    /// Migration only: the tape filled up before the queue was drained.
    fn report_tape_full(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
