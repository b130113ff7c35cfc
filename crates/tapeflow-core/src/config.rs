use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TapeflowError;
use crate::types::Result;

/// Tunables for one data-transfer session.
///
/// Every field has a default so partial documents (for example a JSON
/// object carrying only `disk_threads`) deserialize into a usable config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Payload capacity of each memory block in bytes.
    pub block_size: usize,
    /// Number of memory blocks allocated for the session.
    pub block_count: usize,
    /// Number of disk worker threads.
    pub disk_threads: usize,
    /// Migration: flush the drive after this many files.
    pub files_before_flush: u64,
    /// Migration: flush the drive after this many bytes.
    pub bytes_before_flush: u64,
    /// Recall: number of file reports batched into one client call.
    pub report_file_period: usize,
    /// Upper bound on files requested from the job source per call.
    pub max_files_request: u64,
    /// Upper bound on bytes requested from the job source per call.
    pub max_bytes_request: u64,
    pub heartbeat_period: Duration,
    /// Time without data movement after which a file is reported as stuck.
    pub stuck_period: Duration,
    /// How often the watchdog wakes up to check the counters.
    pub watchdog_poll_period: Duration,
    pub client_timeout: Duration,
    pub tape_load_timeout: Duration,
    /// Enable logical block protection on the drive.
    pub use_lbp: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            block_count: 64,
            disk_threads: 4,
            files_before_flush: 1000,
            bytes_before_flush: 32 * 1024 * 1024 * 1024,
            report_file_period: 500,
            max_files_request: 500,
            max_bytes_request: 80 * 1000 * 1000 * 1000,
            heartbeat_period: Duration::from_secs(2),
            stuck_period: Duration::from_secs(600),
            watchdog_poll_period: Duration::from_millis(100),
            client_timeout: Duration::from_secs(30),
            tape_load_timeout: Duration::from_secs(300),
            use_lbp: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("block_size", self.block_size as u64),
            ("block_count", self.block_count as u64),
            ("disk_threads", self.disk_threads as u64),
            ("files_before_flush", self.files_before_flush),
            ("bytes_before_flush", self.bytes_before_flush),
            ("report_file_period", self.report_file_period as u64),
            ("max_files_request", self.max_files_request),
            ("max_bytes_request", self.max_bytes_request),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TapeflowError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        // Each disk reader needs at least two blocks in flight to overlap
        // with the tape writer.
        if self.block_count < 2 * self.disk_threads {
            return Err(TapeflowError::InvalidConfig(format!(
                "block_count ({}) must be at least twice disk_threads ({})",
                self.block_count, self.disk_threads
            )));
        }

        if self.watchdog_poll_period.is_zero() || self.heartbeat_period.is_zero() {
            return Err(TapeflowError::InvalidConfig(
                "watchdog periods must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Blocks a single migration file may hold at once.
    pub fn migration_credits_per_file(&self) -> usize {
        (self.block_count / self.disk_threads.max(1)).max(1)
    }

    /// Total bytes reserved up front for the block pool.
    pub fn pool_bytes(&self) -> usize {
        self.block_size.saturating_mul(self.block_count)
    }
}
