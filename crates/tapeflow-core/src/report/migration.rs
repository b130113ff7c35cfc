use std::time::Duration;

use crate::client::ClientReporter;
use crate::error::{ENOSPC, SEINTERNAL};
use crate::report::{PackerCore, Report, ReportPacker, ReportSink};
use crate::types::{FileFailure, Result};

/// Migration flavour of the packer.
///
/// Successful files are only forwarded once a [`Report::Flush`] confirms
/// they are durable on tape. Files still held when the session ends are
/// reported as failed.
pub struct MigrationReports {
    core: PackerCore,
    report_period: usize,
}

pub type MigrationReportPacker = ReportPacker<MigrationReports>;

impl ReportPacker<MigrationReports> {
    pub fn new(client: Box<dyn ClientReporter>, report_period: usize, timeout: Duration) -> Self {
        Self::from_sink(MigrationReports {
            core: PackerCore::new("migration", client, timeout),
            report_period: report_period.max(1),
        })
    }
}

impl MigrationReports {
    fn fail_unflushed(&mut self) {
        let unflushed = std::mem::take(&mut self.core.pending_success);
        if unflushed.is_empty() {
            return;
        }
        tracing::warn!(
            files = unflushed.len(),
            "files written after the last flush are reported as failed"
        );
        for file in unflushed {
            self.core.record_failure(FileFailure {
                file_id: file.file_id,
                fseq: file.fseq,
                message: "file written to tape but not flushed before end of session".to_string(),
                code: SEINTERNAL,
            });
        }
    }
}

impl ReportSink for MigrationReports {
    fn core(&mut self) -> &mut PackerCore {
        &mut self.core
    }

    fn execute(&mut self, report: Report) -> Result<()> {
        match report {
            Report::Successful(file) => {
                self.core.pending_success.push(file);
                Ok(())
            }
            Report::Error(failure) => {
                self.core.record_failure(failure);
                if self.core.pending_failures.len() >= self.report_period {
                    let successes = std::mem::take(&mut self.core.pending_success);
                    let sent = self.core.send_pending();
                    self.core.pending_success = successes;
                    sent?;
                }
                Ok(())
            }
            Report::Flush => {
                self.core.summary.flushes += 1;
                if self.core.pending_len() == 0 {
                    tracing::info!("received a flush report with no file to report");
                    return Ok(());
                }
                self.core.send_pending()
            }
            Report::TapeFull => {
                self.core.summary.tape_full = true;
                tracing::info!("tape is full");
                self.core
                    .call("report tape full", |client, timeout| client.report_tape_full(timeout))
            }
            Report::DriveStatus { status, reason } => {
                self.core.drive_status(status, reason);
                Ok(())
            }
            Report::EndOfSession => {
                self.fail_unflushed();
                self.core.send_pending()?;
                self.core.end_session()
            }
            Report::EndOfSessionWithErrors { message, code } => {
                let file_errors = self.core.error_happened;
                self.fail_unflushed();
                self.core.send_pending()?;
                let code = if !file_errors && code != ENOSPC {
                    tracing::warn!(code, "no file failed; reporting internal error code instead");
                    SEINTERNAL
                } else {
                    code
                };
                self.core.end_session_with_errors(message, code)
            }
        }
    }
}
