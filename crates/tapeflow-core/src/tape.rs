//! State and lifecycle shared by the tape read and tape write threads.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::core::sync::{SessionFault, catch_panic};
use crate::drive::{MediaChanger, TapeAlert, TapeDrive};
use crate::error::TapeflowError;
use crate::report::ReportSender;
use crate::reporter::ReporterHandle;
use crate::stats::{StageTimer, TapeSessionStats};
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{DriveStatus, EndOfSessionAction, Result, SessionState, VolumeInfo};
use crate::watchdog::WatchDogHandle;

/// Hardware a tape thread owns for the whole session.
pub struct TapeEndpoints {
    pub drive: Box<dyn TapeDrive>,
    pub changer: Box<dyn MediaChanger>,
    pub volume: VolumeInfo,
}

/// Session-wide channels handed to a tape thread.
#[derive(Clone)]
pub struct SessionChannels {
    pub reports: ReportSender,
    pub reporter: ReporterHandle,
    pub watchdog: WatchDogHandle,
    pub fault: Arc<SessionFault>,
}

/// What a tape thread hands back when joined.
#[derive(Debug, Clone)]
pub struct TapeThreadOutcome {
    pub end_action: EndOfSessionAction,
    pub stats: TapeSessionStats,
    /// Message of the session-fatal error that stopped the thread, if any.
    pub error: Option<String>,
}

pub(crate) struct TapeContext {
    pub(crate) drive: Box<dyn TapeDrive>,
    changer: Box<dyn MediaChanger>,
    pub(crate) volume: VolumeInfo,
    pub(crate) reports: ReportSender,
    reporter: ReporterHandle,
    pub(crate) watchdog: WatchDogHandle,
    pub(crate) fault: Arc<SessionFault>,
    pub(crate) stats: TapeSessionStats,
    pub(crate) timer: StageTimer,
    stage: &'static str,
    load_timeout: Duration,
    use_lbp: bool,
    cleaned_up: bool,
    end_action: EndOfSessionAction,
}

impl TapeContext {
    pub(crate) fn new(
        endpoints: TapeEndpoints,
        channels: SessionChannels,
        config: &SessionConfig,
    ) -> Self {
        let TapeEndpoints {
            drive,
            changer,
            volume,
        } = endpoints;
        let SessionChannels {
            reports,
            reporter,
            watchdog,
            fault,
        } = channels;
        Self {
            drive,
            changer,
            volume,
            reports,
            reporter,
            watchdog,
            fault,
            stats: TapeSessionStats::default(),
            timer: StageTimer::new(),
            stage: "Error_setup",
            load_timeout: config.tape_load_timeout,
            use_lbp: config.use_lbp,
            cleaned_up: false,
            end_action: EndOfSessionAction::MarkDriveUp,
        }
    }

    /// Names the error counter bumped if the current step fails.
    pub(crate) fn set_stage(&mut self, stage: &'static str) {
        self.stage = stage;
    }

    pub(crate) fn count_stage_error(&self) {
        self.watchdog.add_to_error_count(self.stage);
    }

    /// Mounts the volume, waits for the drive and checks the label. Write
    /// sessions also refuse critical tape alerts and write-protected tapes.
    pub(crate) fn mount_and_check(&mut self, for_write: bool) -> Result<()> {
        let vid = self.volume.vid.clone();
        self.reports.report_drive_status(DriveStatus::Mounting, None);
        self.reporter.report_state(SessionState::Mounting);
        self.timer.lap();

        self.set_stage(if for_write {
            "Error_tapeMountForWrite"
        } else {
            "Error_tapeMountForRead"
        });
        self.changer
            .mount(&vid, &self.volume.library_slot, !for_write)
            .map_err(|err| err.with_context(format!("mounting {vid}")))?;
        tracing::info!(vid = %vid, unit = %self.volume.drive_unit, "tape mounted in drive");

        self.set_stage("Error_tapeLoad");
        self.drive.wait_until_ready(self.load_timeout)?;
        self.stats.mount_time += self.timer.lap();
        self.reporter.tape_mounted();
        self.watchdog.add_parameter(
            "mountTime",
            format!("{:.6}", self.stats.mount_time.as_secs_f64()),
        );

        if for_write {
            self.set_stage("Error_checkingTapeAlert");
            let alerts = self.log_tape_alerts();
            if let Some(alert) = alerts.iter().find(|alert| alert.critical_for_write) {
                return Err(TapeflowError::Drive(format!(
                    "critical tape alert {:#06x} ({}) present; refusing to write",
                    alert.code, alert.description
                )));
            }
            self.set_stage("Error_tapeNotWriteable");
            if self.drive.is_write_protected()? {
                return Err(TapeflowError::Drive(format!("tape {vid} is write protected")));
            }
        }

        self.set_stage("Error_checkingLabel");
        self.drive.check_label(&vid)?;
        if self.use_lbp {
            self.set_stage("Error_settingLbp");
            self.drive.enable_lbp()?;
            self.watchdog.add_parameter("LBPMode", "LBP_On");
        }
        self.stats.position_time += self.timer.lap();
        Ok(())
    }

    pub(crate) fn start_transfer(&mut self) {
        self.reporter.report_state(SessionState::Running);
        self.reports.report_drive_status(DriveStatus::Transferring, None);
    }

    /// Logs the drive's tape alerts. Failing to read them is not an error.
    pub(crate) fn log_tape_alerts(&mut self) -> Vec<TapeAlert> {
        match self.drive.tape_alerts() {
            Ok(alerts) => {
                for alert in &alerts {
                    tracing::warn!(
                        vid = %self.volume.vid,
                        code = alert.code,
                        description = %alert.description,
                        critical_for_write = alert.critical_for_write,
                        "tape alert"
                    );
                    self.watchdog.add_parameter(
                        format!("tapeAlert_{:#06x}", alert.code),
                        alert.description.clone(),
                    );
                }
                alerts
            }
            Err(err) => {
                tracing::warn!(vid = %self.volume.vid, error = %err, "could not read tape alerts");
                Vec::new()
            }
        }
    }

    /// Unloads and dismounts the tape and tells the supervisor. Runs once;
    /// later calls return the first outcome.
    ///
    /// The drive is put down after a session-fatal error other than a full
    /// tape, or when the hardware cannot be released.
    pub(crate) fn cleanup(&mut self, fatal: Option<&TapeflowError>) -> EndOfSessionAction {
        if self.cleaned_up {
            return self.end_action;
        }
        self.cleaned_up = true;
        self.timer.lap();
        self.reports.report_drive_status(DriveStatus::CleaningUp, None);
        telemetry::increment_counter(
            tags::METRIC_TAPE_CLEANUP_COUNT,
            1,
            &[("subsystem", "tape"), ("op", "cleanup")],
        );

        let released = self.release_hardware();
        let drive_failed = fatal.is_some_and(|err| !err.is_end_of_tape());
        self.end_action = match released {
            Ok(()) if !drive_failed => {
                self.reports.report_drive_status(DriveStatus::Up, None);
                EndOfSessionAction::MarkDriveUp
            }
            Ok(()) => {
                let reason = fatal.map(ToString::to_string);
                self.reports.report_drive_status(DriveStatus::Down, reason);
                EndOfSessionAction::MarkDriveDown
            }
            Err(err) => {
                tracing::error!(
                    vid = %self.volume.vid,
                    stage = self.stage,
                    error = %err,
                    "tape cleanup failed"
                );
                self.count_stage_error();
                self.reports
                    .report_drive_status(DriveStatus::Down, Some(err.to_string()));
                EndOfSessionAction::MarkDriveDown
            }
        };

        self.reporter.tape_unmounted();
        self.reporter.report_state(SessionState::ShuttingDown);
        self.reporter.finish();
        tracing::info!(vid = %self.volume.vid, end_action = ?self.end_action, "tape cleanup done");
        self.end_action
    }

    fn release_hardware(&mut self) -> Result<()> {
        self.log_tape_alerts();
        if let Err(err) = self.drive.wait_until_ready(self.load_timeout) {
            tracing::debug!(error = %err, "drive not ready before unload");
        }
        self.set_stage("Error_tapeUnload");
        if !self.drive.has_tape_in_place()? {
            tracing::info!(vid = %self.volume.vid, "no tape in drive; nothing to unload");
            return Ok(());
        }
        if self.use_lbp {
            if let Err(err) = self.drive.disable_lbp() {
                tracing::warn!(error = %err, "could not disable logical block protection");
            }
        }
        self.reports.report_drive_status(DriveStatus::Unloading, None);
        self.drive.unload()?;
        self.stats.unload_time += self.timer.lap();

        self.set_stage("Error_tapeDismount");
        self.reports.report_drive_status(DriveStatus::Unmounting, None);
        self.reporter.report_state(SessionState::Unmounting);
        let vid = self.volume.vid.clone();
        self.changer
            .dismount(&vid, &self.volume.library_slot)
            .map_err(|err| err.with_context(format!("dismounting {vid}")))?;
        self.stats.unmount_time += self.timer.lap();
        Ok(())
    }

    /// Final statistics, also pushed to the watchdog.
    pub(crate) fn finish_stats(&mut self) -> TapeSessionStats {
        self.stats.total_time = self.timer.total();
        self.watchdog.update_stats(&self.stats);
        tracing::info!(
            vid = %self.volume.vid,
            files = self.stats.files_count,
            failed = self.stats.failed_files,
            bytes = self.stats.data_volume,
            flushes = self.stats.flush_count,
            total_secs = self.stats.total_time.as_secs_f64(),
            "tape thread statistics"
        );
        self.stats.clone()
    }
}

/// Runs `f`, turning a panic into a drive error so the caller's cleanup
/// still happens.
pub(crate) fn guarded<F>(what: &'static str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    catch_panic(what, f, TapeflowError::Drive)
}
