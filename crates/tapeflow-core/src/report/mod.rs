//! Ordered reporting of per-file outcomes to the client.
//!
//! Tape and disk threads push [`Report`]s through a [`ReportSender`]; a
//! single packer thread drains them in FIFO order, batches file outcomes
//! and closes the client session with exactly one end-of-session call.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::client::ClientReporter;
use crate::core::queue::BlockingQueue;
use crate::core::sync::{catch_panic, panic_details};
use crate::error::{SEINTERNAL, TapeflowError};
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{DriveStatus, FileFailure, FileReport, Result};
use crate::watchdog::WatchDogHandle;

pub mod migration;
pub mod recall;

pub use migration::{MigrationReportPacker, MigrationReports};
pub use recall::{RecallReportPacker, RecallReports};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Successful(FileReport),
    Error(FileFailure),
    /// Everything reported before this point is durable on tape.
    Flush,
    TapeFull,
    DriveStatus {
        status: DriveStatus,
        reason: Option<String>,
    },
    EndOfSession,
    EndOfSessionWithErrors {
        message: String,
        code: i32,
    },
}

impl Report {
    /// Terminal reports end the packer's processing loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::EndOfSession | Self::EndOfSessionWithErrors { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Successful(_) => "Successful",
            Self::Error(_) => "Error",
            Self::Flush => "Flush",
            Self::TapeFull => "TapeFull",
            Self::DriveStatus { .. } => "DriveStatus",
            Self::EndOfSession => "EndOfSession",
            Self::EndOfSessionWithErrors { .. } => "EndOfSessionWithErrors",
        }
    }
}

/// Producer side of a report packer. Pushing never blocks.
#[derive(Clone)]
pub struct ReportSender {
    queue: Arc<BlockingQueue<Report>>,
}

impl ReportSender {
    pub fn push(&self, report: Report) {
        self.queue.push(report);
    }

    pub fn report_completed_job(&self, file: FileReport) {
        self.push(Report::Successful(file));
    }

    pub fn report_failed_job(&self, failure: FileFailure) {
        self.push(Report::Error(failure));
    }

    pub fn report_flush(&self) {
        self.push(Report::Flush);
    }

    pub fn report_tape_full(&self) {
        self.push(Report::TapeFull);
    }

    pub fn report_drive_status(&self, status: DriveStatus, reason: Option<String>) {
        self.push(Report::DriveStatus { status, reason });
    }

    pub fn report_end_of_session(&self) {
        self.push(Report::EndOfSession);
    }

    pub fn report_end_of_session_with_errors(&self, message: impl Into<String>, code: i32) {
        self.push(Report::EndOfSessionWithErrors {
            message: message.into(),
            code,
        });
    }
}

/// How the client session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalReport {
    EndOfSession,
    EndOfSessionWithErrors { message: String, code: i32 },
}

/// What the packer thread did, returned when it is joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackerSummary {
    pub reports_processed: usize,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub client_calls: usize,
    pub flushes: usize,
    pub final_report: Option<FinalReport>,
    /// A clean end of session was turned into an end with errors.
    pub substituted_end_of_session: bool,
    /// Inconsistencies that were logged, such as a failed session with no
    /// failed file.
    pub anomalies: usize,
    pub client_failed: bool,
    /// Reports found in the queue after the terminal one.
    pub missed_reports: usize,
    pub tape_full: bool,
}

/// Client-facing state shared by both packer flavours.
pub struct PackerCore {
    name: &'static str,
    client: Box<dyn ClientReporter>,
    timeout: Duration,
    watchdog: Option<WatchDogHandle>,
    pending_success: Vec<FileReport>,
    pending_failures: Vec<FileFailure>,
    error_happened: bool,
    client_down: bool,
    summary: PackerSummary,
}

impl PackerCore {
    fn new(name: &'static str, client: Box<dyn ClientReporter>, timeout: Duration) -> Self {
        Self {
            name,
            client,
            timeout,
            watchdog: None,
            pending_success: Vec::new(),
            pending_failures: Vec::new(),
            error_happened: false,
            client_down: false,
            summary: PackerSummary::default(),
        }
    }

    fn pending_len(&self) -> usize {
        self.pending_success.len() + self.pending_failures.len()
    }

    fn record_failure(&mut self, failure: FileFailure) {
        tracing::error!(
            packer = self.name,
            file_id = failure.file_id,
            fseq = failure.fseq,
            code = failure.code,
            message = %failure.message,
            "file transfer failed"
        );
        self.error_happened = true;
        self.pending_failures.push(failure);
    }

    fn errors_recorded(&self) -> bool {
        self.error_happened
            || self
                .watchdog
                .as_ref()
                .is_some_and(WatchDogHandle::error_happened)
    }

    /// Calls the client. A panicking client counts as a failed call.
    fn call<F>(&mut self, what: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn ClientReporter, Duration) -> Result<()>,
    {
        self.summary.client_calls += 1;
        telemetry::increment_counter(
            tags::METRIC_REPORT_CLIENT_CALL_COUNT,
            1,
            &[("subsystem", "report"), ("op", what)],
        );
        let timeout = self.timeout;
        let client = self.client.as_mut();
        catch_panic(what, || f(client, timeout), TapeflowError::Client)
            .map_err(|err| err.with_context(what))
    }

    /// Sends batched failures then successes.
    fn send_pending(&mut self) -> Result<()> {
        if !self.pending_failures.is_empty() {
            let failures = std::mem::take(&mut self.pending_failures);
            self.call("report failure", |client, timeout| {
                client.report_failure(&failures, timeout)
            })?;
            self.summary.files_failed += failures.len();
            telemetry::increment_counter(
                tags::METRIC_REPORT_FILES_FAILED_COUNT,
                failures.len() as u64,
                &[("subsystem", "report"), ("op", "flush")],
            );
        }
        if !self.pending_success.is_empty() {
            let successes = std::mem::take(&mut self.pending_success);
            self.call("report success", |client, timeout| {
                client.report_success(&successes, timeout)
            })?;
            self.summary.files_succeeded += successes.len();
            telemetry::increment_counter(
                tags::METRIC_REPORT_FILES_OK_COUNT,
                successes.len() as u64,
                &[("subsystem", "report"), ("op", "flush")],
            );
            tracing::debug!(
                packer = self.name,
                files = successes.len(),
                "reported successful files"
            );
        }
        Ok(())
    }

    fn drive_status(&mut self, status: DriveStatus, reason: Option<String>) {
        tracing::info!(packer = self.name, status = status.as_str(), "drive status changed");
        if let Err(err) = self.call("report drive status", |client, timeout| {
            client.report_drive_status(status, reason.as_deref(), timeout)
        }) {
            tracing::warn!(packer = self.name, error = %err, "failed to report drive status");
        }
    }

    /// Closes the client session, downgrading to an end with errors if any
    /// error was recorded along the way.
    fn end_session(&mut self) -> Result<()> {
        if self.errors_recorded() {
            tracing::warn!(
                packer = self.name,
                "end of session requested after errors; reporting end of session with errors"
            );
            self.summary.substituted_end_of_session = true;
            telemetry::increment_counter(
                tags::METRIC_REPORT_END_SUBSTITUTED_COUNT,
                1,
                &[("subsystem", "report"), ("op", "end_of_session")],
            );
            return self.close_with_errors("Previous file errors".to_string(), SEINTERNAL);
        }

        self.summary.final_report = Some(FinalReport::EndOfSession);
        self.call("report end of session", |client, timeout| {
            client.report_end_of_session(timeout)
        })?;
        self.set_status_param("success");
        tracing::info!(packer = self.name, "reported end of session to client");
        Ok(())
    }

    fn end_session_with_errors(&mut self, message: String, code: i32) -> Result<()> {
        if !self.error_happened {
            self.summary.anomalies += 1;
            tracing::error!(
                packer = self.name,
                %message,
                code,
                "end of session with errors reported although no file error was recorded"
            );
        }
        self.close_with_errors(message, code)
    }

    fn close_with_errors(&mut self, message: String, code: i32) -> Result<()> {
        self.summary.final_report = Some(FinalReport::EndOfSessionWithErrors {
            message: message.clone(),
            code,
        });
        self.call("report end of session with error", |client, timeout| {
            client.report_end_of_session_with_error(&message, code, timeout)
        })?;
        self.set_status_param("failure");
        tracing::info!(
            packer = self.name,
            %message,
            code,
            "reported end of session with errors to client"
        );
        Ok(())
    }

    /// Makes one last attempt at closing the client session after a failed
    /// call, then stops talking to the client.
    fn abort_after_client_failure(&mut self, error: &TapeflowError) {
        tracing::error!(
            packer = self.name,
            %error,
            "client report failed; closing session with errors"
        );
        self.client_down = true;
        self.summary.client_failed = true;
        telemetry::increment_counter(
            tags::METRIC_REPORT_CLIENT_FAILURE_COUNT,
            1,
            &[("subsystem", "report"), ("op", "client")],
        );
        if let Some(watchdog) = &self.watchdog {
            watchdog.add_to_error_count("Error_clientCommunication");
        }
        let message = format!("Failed to report to client: {error}");
        if let Err(err) = self.close_with_errors(message, SEINTERNAL) {
            tracing::error!(
                packer = self.name,
                error = %err,
                "fallback end of session report failed too"
            );
        }
    }

    fn set_status_param(&self, status: &str) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.add_parameter("status", status);
        }
    }
}

/// Per-variant report handling plugged into [`ReportPacker`].
pub trait ReportSink: Send + 'static {
    fn core(&mut self) -> &mut PackerCore;
    /// Handles one report. An error means a client call failed.
    fn execute(&mut self, report: Report) -> Result<()>;
}

/// Owns the report queue and the packer thread draining it.
pub struct ReportPacker<S: ReportSink> {
    queue: Arc<BlockingQueue<Report>>,
    sink: Option<S>,
    thread: Option<JoinHandle<PackerSummary>>,
}

impl<S: ReportSink> ReportPacker<S> {
    fn from_sink(sink: S) -> Self {
        Self {
            queue: Arc::new(BlockingQueue::new()),
            sink: Some(sink),
            thread: None,
        }
    }

    pub fn sender(&self) -> ReportSender {
        ReportSender {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Lets the packer consult and update the session's error counters.
    pub fn set_watchdog(&mut self, watchdog: WatchDogHandle) {
        if let Some(sink) = self.sink.as_mut() {
            sink.core().watchdog = Some(watchdog);
        }
    }

    /// Closes the client session directly, for sessions that end before
    /// the packer thread is started.
    pub fn synchronous_report_end_of_session(&mut self) -> Result<()> {
        self.with_idle_core(PackerCore::end_session)
    }

    pub fn synchronous_report_end_with_errors(&mut self, message: &str, code: i32) -> Result<()> {
        let message = message.to_string();
        self.with_idle_core(move |core| core.close_with_errors(message, code))
    }

    pub fn start_threads(&mut self) {
        let Some(sink) = self.sink.take() else {
            tracing::warn!("report packer already started");
            return;
        };
        let queue = Arc::clone(&self.queue);
        self.thread = Some(thread::spawn(move || run_report_loop(&queue, sink)));
    }

    /// Joins the packer thread. A packer that never ran returns what its
    /// synchronous reports did.
    pub fn wait_threads(&mut self) -> Result<PackerSummary> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|payload| {
                TapeflowError::Other(anyhow::anyhow!(
                    "report packer thread panicked: {}",
                    panic_details(payload.as_ref())
                ))
            }),
            None => Ok(self
                .sink
                .as_mut()
                .map(|sink| std::mem::take(&mut sink.core().summary))
                .unwrap_or_default()),
        }
    }

    fn with_idle_core<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PackerCore) -> Result<()>,
    {
        match self.sink.as_mut() {
            Some(sink) => f(sink.core()),
            None => Err(TapeflowError::Client(
                "report packer thread already running".to_string(),
            )),
        }
    }
}

fn run_report_loop<S: ReportSink>(queue: &BlockingQueue<Report>, mut sink: S) -> PackerSummary {
    loop {
        let report = queue.pop();
        let terminal = report.is_terminal();
        let kind = report.kind();
        let core = sink.core();
        core.summary.reports_processed += 1;

        if core.client_down {
            tracing::debug!(packer = core.name, kind, "client unreachable; report not forwarded");
        } else if let Err(err) = sink.execute(report) {
            let core = sink.core();
            if terminal {
                // Nothing left to coordinate with the client.
                core.client_down = true;
                core.summary.client_failed = true;
                tracing::error!(packer = core.name, error = %err, "end of session report failed");
            } else {
                core.abort_after_client_failure(&err);
            }
        }

        if terminal {
            break;
        }
    }

    let core = sink.core();
    while let Some(missed) = queue.try_pop() {
        if matches!(missed, Report::DriveStatus { .. }) {
            tracing::debug!(packer = core.name, "drive status report after end of session");
            continue;
        }
        core.summary.missed_reports += 1;
        telemetry::increment_counter(
            tags::METRIC_REPORT_MISSED_COUNT,
            1,
            &[("subsystem", "report"), ("op", "drain")],
        );
        tracing::error!(
            packer = core.name,
            kind = missed.kind(),
            "report found in queue after end of session"
        );
    }

    let summary = std::mem::take(&mut core.summary);
    tracing::info!(
        packer = core.name,
        processed = summary.reports_processed,
        succeeded = summary.files_succeeded,
        failed = summary.files_failed,
        client_calls = summary.client_calls,
        "report packer finished"
    );
    summary
}
