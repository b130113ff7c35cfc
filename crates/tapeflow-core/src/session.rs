//! Wiring of one mount session: memory pool, tape thread, disk pool,
//! injector, report packer, watchdog and lifecycle reporter.

use std::sync::Arc;

use crate::buffer::MemoryBlockPool;
use crate::client::ClientReporter;
use crate::config::SessionConfig;
use crate::core::sync::{CompletionLatch, SessionFault};
use crate::disk::DiskFileFactory;
use crate::drive::{MediaChanger, TapeDrive};
use crate::error::TapeflowError;
use crate::migration::{
    DiskReadThreadPool, MigrationJobSource, MigrationTaskInjector, TapeWriteSingleThread,
};
use crate::proxy::TapedProxy;
use crate::recall::{DiskWriteThreadPool, RecallJobSource, RecallTaskInjector, TapeReadSingleThread};
use crate::report::{
    MigrationReportPacker, PackerSummary, RecallReportPacker, ReportPacker, ReportSink,
};
use crate::reporter::TapeServerReporter;
use crate::stats::{DiskStats, TapeSessionStats};
use crate::tape::{SessionChannels, TapeEndpoints, TapeThreadOutcome};
use crate::telemetry::worker::{DefaultWorkerTelemetry, WorkerTelemetry};
use crate::types::{EndOfSessionAction, Result, SessionType, VolumeInfo};
use crate::watchdog::TaskWatchDog;

/// Everything a finished session hands back to the daemon.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub end_action: EndOfSessionAction,
    pub report: PackerSummary,
    pub tape_stats: TapeSessionStats,
    pub disk_stats: DiskStats,
    pub files_injected: usize,
    /// Blocks back in the pool once every thread is joined.
    pub free_blocks: usize,
    pub pool_capacity: usize,
    /// The error that ended the session early, if any.
    pub error: Option<String>,
}

/// Runs recall and migration sessions for one drive.
pub struct DataTransferSession {
    config: SessionConfig,
    volume: VolumeInfo,
    proxy: Arc<dyn TapedProxy>,
    disk: Arc<dyn DiskFileFactory>,
    telemetry: Arc<dyn WorkerTelemetry>,
}

impl DataTransferSession {
    pub fn new(
        config: SessionConfig,
        volume: VolumeInfo,
        proxy: Arc<dyn TapedProxy>,
        disk: Arc<dyn DiskFileFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            volume,
            proxy,
            disk,
            telemetry: Arc::new(DefaultWorkerTelemetry),
        })
    }

    pub fn with_worker_telemetry(mut self, telemetry: Arc<dyn WorkerTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Reads the requested files from tape to disk.
    pub fn execute_recall(
        &self,
        drive: Box<dyn TapeDrive>,
        changer: Box<dyn MediaChanger>,
        client: Box<dyn ClientReporter>,
        source: Box<dyn RecallJobSource>,
    ) -> Result<SessionOutcome> {
        self.expect_session_type(SessionType::Recall)?;
        let config = &self.config;
        let pool = Arc::new(MemoryBlockPool::new(config.block_size, config.block_count)?);
        let fault = Arc::new(SessionFault::new());
        let tape_done = Arc::new(CompletionLatch::new());

        let mut packer =
            RecallReportPacker::new(client, config.report_file_period, config.client_timeout);
        let mut watchdog = self.watchdog(SessionType::Recall);
        packer.set_watchdog(watchdog.handle());
        let mut reporter = TapeServerReporter::new(Arc::clone(&self.proxy), self.volume.clone());

        let mut tape = TapeReadSingleThread::new(
            self.endpoints(drive, changer),
            SessionChannels {
                reports: packer.sender(),
                reporter: reporter.handle(),
                watchdog: watchdog.handle(),
                fault: Arc::clone(&fault),
            },
            config,
            Arc::clone(&pool),
            Arc::clone(&tape_done),
        );
        let mut disk = DiskWriteThreadPool::new(
            config.disk_threads,
            Arc::clone(&self.disk),
            packer.sender(),
            Arc::clone(&fault),
            Arc::clone(&self.telemetry),
        )
        .with_tape_latch(tape_done);
        let mut injector =
            RecallTaskInjector::new(source, &tape, &disk, Arc::clone(&fault), config);
        tape.set_task_injector(injector.handle());

        if let Some(outcome) =
            self.check_first_batch(injector.synchronous_fetch(), &mut packer, &pool)
        {
            return Ok(outcome);
        }

        tracing::info!(
            vid = %self.volume.vid,
            unit = %self.volume.drive_unit,
            "starting recall session"
        );
        watchdog.start_thread();
        tape.start_threads();
        disk.start_threads();
        packer.start_threads();
        injector.start_threads();
        reporter.start_threads();

        let injected = injector.wait_threads();
        let disk_stats = disk.wait_threads();
        let tape_outcome = tape.wait_threads();
        let report = packer.wait_threads();
        let delivered = reporter.wait_threads();
        let stopped = watchdog.stop_and_wait();
        tracing::debug!(events = ?delivered.as_ref().ok(), "lifecycle events delivered");
        delivered?;
        stopped?;

        Self::outcome(injected?, disk_stats?, tape_outcome?, report?, &pool)
    }

    /// Appends the requested files to the tape.
    pub fn execute_migration(
        &self,
        drive: Box<dyn TapeDrive>,
        changer: Box<dyn MediaChanger>,
        client: Box<dyn ClientReporter>,
        source: Box<dyn MigrationJobSource>,
    ) -> Result<SessionOutcome> {
        self.expect_session_type(SessionType::Migration)?;
        let config = &self.config;
        let pool = Arc::new(MemoryBlockPool::new(config.block_size, config.block_count)?);
        let fault = Arc::new(SessionFault::new());

        let mut packer =
            MigrationReportPacker::new(client, config.report_file_period, config.client_timeout);
        let mut watchdog = self.watchdog(SessionType::Migration);
        packer.set_watchdog(watchdog.handle());
        let mut reporter = TapeServerReporter::new(Arc::clone(&self.proxy), self.volume.clone());

        let mut tape = TapeWriteSingleThread::new(
            self.endpoints(drive, changer),
            SessionChannels {
                reports: packer.sender(),
                reporter: reporter.handle(),
                watchdog: watchdog.handle(),
                fault: Arc::clone(&fault),
            },
            config,
        );
        let mut disk = DiskReadThreadPool::new(
            config.disk_threads,
            Arc::clone(&self.disk),
            Arc::clone(&pool),
            config.max_files_request,
            Arc::clone(&self.telemetry),
        );
        let mut injector =
            MigrationTaskInjector::new(source, &tape, &disk, Arc::clone(&fault), config);
        tape.set_task_injector(injector.handle());
        disk.set_task_injector(injector.handle());

        if let Some(outcome) =
            self.check_first_batch(injector.synchronous_injection(), &mut packer, &pool)
        {
            return Ok(outcome);
        }
        let first_fseq = injector.first_fseq_to_write().unwrap_or(1);
        tape.set_last_fseq(first_fseq.saturating_sub(1));

        tracing::info!(
            vid = %self.volume.vid,
            unit = %self.volume.drive_unit,
            first_fseq,
            "starting migration session"
        );
        watchdog.start_thread();
        tape.start_threads();
        disk.start_threads();
        packer.start_threads();
        injector.start_threads();
        reporter.start_threads();

        let injected = injector.wait_threads();
        let disk_stats = disk.wait_threads();
        let tape_outcome = tape.wait_threads();
        let report = packer.wait_threads();
        let delivered = reporter.wait_threads();
        let stopped = watchdog.stop_and_wait();
        tracing::debug!(events = ?delivered.as_ref().ok(), "lifecycle events delivered");
        delivered?;
        stopped?;

        Self::outcome(injected?, disk_stats?, tape_outcome?, report?, &pool)
    }

    fn expect_session_type(&self, expected: SessionType) -> Result<()> {
        if self.volume.session_type != expected {
            return Err(TapeflowError::InvalidConfig(format!(
                "volume {} is set up for a {} session, not a {}",
                self.volume.vid,
                self.volume.session_type.as_str(),
                expected.as_str()
            )));
        }
        Ok(())
    }

    fn endpoints(
        &self,
        drive: Box<dyn TapeDrive>,
        changer: Box<dyn MediaChanger>,
    ) -> TapeEndpoints {
        TapeEndpoints {
            drive,
            changer,
            volume: self.volume.clone(),
        }
    }

    fn watchdog(&self, session_type: SessionType) -> TaskWatchDog {
        TaskWatchDog::new(
            session_type,
            self.volume.drive_unit.clone(),
            self.config.heartbeat_period,
            self.config.stuck_period,
            self.config.watchdog_poll_period,
            Arc::clone(&self.proxy),
        )
    }

    /// Ends the session before any thread starts when the first batch is
    /// empty or cannot be fetched. The tape is never mounted and the drive
    /// stays up.
    fn check_first_batch<S: ReportSink>(
        &self,
        first_batch: Result<bool>,
        packer: &mut ReportPacker<S>,
        pool: &MemoryBlockPool,
    ) -> Option<SessionOutcome> {
        let error = match first_batch {
            Ok(true) => return None,
            Ok(false) => {
                tracing::info!(
                    vid = %self.volume.vid,
                    "nothing to transfer; ending session without mounting"
                );
                if let Err(err) = packer.synchronous_report_end_of_session() {
                    tracing::error!(error = %err, "failed to report end of an empty session");
                }
                None
            }
            Err(err) => {
                tracing::error!(
                    vid = %self.volume.vid,
                    error = %err,
                    "failed to get the first batch of files"
                );
                if let Err(report_err) =
                    packer.synchronous_report_end_with_errors(&err.to_string(), err.error_code())
                {
                    tracing::error!(
                        error = %report_err,
                        "failed to report end of session with errors"
                    );
                }
                Some(err.to_string())
            }
        };
        Some(SessionOutcome {
            end_action: EndOfSessionAction::MarkDriveUp,
            report: packer.wait_threads().unwrap_or_default(),
            tape_stats: TapeSessionStats::default(),
            disk_stats: DiskStats::default(),
            files_injected: 0,
            free_blocks: pool.free_blocks(),
            pool_capacity: pool.capacity(),
            error,
        })
    }

    fn outcome(
        files_injected: usize,
        disk_stats: DiskStats,
        tape: TapeThreadOutcome,
        report: PackerSummary,
        pool: &MemoryBlockPool,
    ) -> Result<SessionOutcome> {
        let outcome = SessionOutcome {
            end_action: tape.end_action,
            report,
            tape_stats: tape.stats,
            disk_stats,
            files_injected,
            free_blocks: pool.free_blocks(),
            pool_capacity: pool.capacity(),
            error: tape.error,
        };
        tracing::info!(
            end_action = ?outcome.end_action,
            files_injected,
            succeeded = outcome.report.files_succeeded,
            failed = outcome.report.files_failed,
            final_report = ?outcome.report.final_report,
            "session finished"
        );
        Ok(outcome)
    }
}
