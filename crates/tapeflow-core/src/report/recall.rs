use std::time::Duration;

use crate::client::ClientReporter;
use crate::report::{PackerCore, Report, ReportPacker, ReportSink};
use crate::types::{DriveStatus, Result};

/// Recall flavour of the packer: file outcomes are forwarded every
/// `report_period` files and at the end of the session.
///
/// The tape side is done once the drive reports `Unmounting`, or its final
/// `Up`/`Down` status when there was no tape to unmount. An end of session
/// arriving before that is logged and counted as an anomaly.
pub struct RecallReports {
    core: PackerCore,
    report_period: usize,
    tape_done: bool,
}

pub type RecallReportPacker = ReportPacker<RecallReports>;

impl ReportPacker<RecallReports> {
    pub fn new(client: Box<dyn ClientReporter>, report_period: usize, timeout: Duration) -> Self {
        Self::from_sink(RecallReports {
            core: PackerCore::new("recall", client, timeout),
            report_period: report_period.max(1),
            tape_done: false,
        })
    }
}

impl RecallReports {
    fn mark_disk_done(&mut self) {
        if self.tape_done {
            tracing::debug!("disk side of the recall is done");
            return;
        }
        self.core.summary.anomalies += 1;
        tracing::warn!("recall ended before the tape side reported it was done");
    }

    fn flush_if_due(&mut self) -> Result<()> {
        if self.core.pending_len() >= self.report_period {
            self.core.send_pending()?;
        }
        Ok(())
    }
}

impl ReportSink for RecallReports {
    fn core(&mut self) -> &mut PackerCore {
        &mut self.core
    }

    fn execute(&mut self, report: Report) -> Result<()> {
        let kind = report.kind();
        match report {
            Report::Successful(file) => {
                self.core.pending_success.push(file);
                self.flush_if_due()
            }
            Report::Error(failure) => {
                self.core.record_failure(failure);
                self.flush_if_due()
            }
            Report::DriveStatus { status, reason } => {
                if matches!(
                    status,
                    DriveStatus::Unmounting | DriveStatus::Up | DriveStatus::Down
                ) {
                    self.tape_done = true;
                }
                self.core.drive_status(status, reason);
                Ok(())
            }
            Report::EndOfSession => {
                self.mark_disk_done();
                self.core.send_pending()?;
                self.core.end_session()
            }
            Report::EndOfSessionWithErrors { message, code } => {
                self.mark_disk_done();
                self.core.send_pending()?;
                self.core.end_session_with_errors(message, code)
            }
            Report::Flush | Report::TapeFull => {
                self.core.summary.anomalies += 1;
                tracing::warn!(kind, "unexpected report in a recall session");
                Ok(())
            }
        }
    }
}
