use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Measures consecutive stages of a loop: each `lap` returns the time since
/// the previous one.
#[derive(Debug, Clone, Copy)]
pub struct StageTimer {
    started_at: Instant,
    last: Instant,
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTimer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last: now,
        }
    }

    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        elapsed
    }

    pub fn total(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Where the tape thread spent its time, and how much it moved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapeSessionStats {
    pub mount_time: Duration,
    pub position_time: Duration,
    pub wait_instructions_time: Duration,
    pub wait_free_memory_time: Duration,
    pub wait_data_time: Duration,
    pub checksum_time: Duration,
    pub read_write_time: Duration,
    pub flush_time: Duration,
    pub unload_time: Duration,
    pub unmount_time: Duration,
    pub total_time: Duration,
    pub data_volume: u64,
    pub files_count: u64,
    pub failed_files: u64,
    pub flush_count: u64,
}

impl TapeSessionStats {
    pub fn add(&mut self, other: &Self) {
        self.mount_time += other.mount_time;
        self.position_time += other.position_time;
        self.wait_instructions_time += other.wait_instructions_time;
        self.wait_free_memory_time += other.wait_free_memory_time;
        self.wait_data_time += other.wait_data_time;
        self.checksum_time += other.checksum_time;
        self.read_write_time += other.read_write_time;
        self.flush_time += other.flush_time;
        self.unload_time += other.unload_time;
        self.unmount_time += other.unmount_time;
        self.total_time += other.total_time;
        self.data_volume += other.data_volume;
        self.files_count += other.files_count;
        self.failed_files += other.failed_files;
        self.flush_count += other.flush_count;
    }

    /// Time spent actually moving or verifying data.
    pub fn transfer_time(&self) -> Duration {
        self.read_write_time + self.checksum_time + self.flush_time
    }

    /// Key/value pairs suitable for a heartbeat log line.
    pub fn log_params(&self) -> Vec<(String, String)> {
        let secs = |d: Duration| format!("{:.6}", d.as_secs_f64());
        vec![
            ("mountTime".to_string(), secs(self.mount_time)),
            ("positionTime".to_string(), secs(self.position_time)),
            ("waitInstructionsTime".to_string(), secs(self.wait_instructions_time)),
            ("waitFreeMemoryTime".to_string(), secs(self.wait_free_memory_time)),
            ("waitDataTime".to_string(), secs(self.wait_data_time)),
            ("checksumTime".to_string(), secs(self.checksum_time)),
            ("readWriteTime".to_string(), secs(self.read_write_time)),
            ("flushTime".to_string(), secs(self.flush_time)),
            ("unloadTime".to_string(), secs(self.unload_time)),
            ("unmountTime".to_string(), secs(self.unmount_time)),
            ("totalTime".to_string(), secs(self.total_time)),
            ("dataVolume".to_string(), self.data_volume.to_string()),
            ("filesCount".to_string(), self.files_count.to_string()),
        ]
    }
}

/// Per-worker disk side statistics, summed when the pool shuts down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub open_time: Duration,
    pub read_write_time: Duration,
    pub checksum_time: Duration,
    pub wait_data_time: Duration,
    pub wait_free_memory_time: Duration,
    pub close_time: Duration,
    pub transfer_time: Duration,
    pub data_volume: u64,
    pub files_count: u64,
    pub failed_files: u64,
}

impl DiskStats {
    pub fn add(&mut self, other: &Self) {
        self.open_time += other.open_time;
        self.read_write_time += other.read_write_time;
        self.checksum_time += other.checksum_time;
        self.wait_data_time += other.wait_data_time;
        self.wait_free_memory_time += other.wait_free_memory_time;
        self.close_time += other.close_time;
        self.transfer_time += other.transfer_time;
        self.data_volume += other.data_volume;
        self.files_count += other.files_count;
        self.failed_files += other.failed_files;
    }

    /// Bytes per second over the time spent transferring, or zero.
    pub fn throughput(&self) -> f64 {
        let secs = self.transfer_time.as_secs_f64();
        if secs > 0.0 {
            self.data_volume as f64 / secs
        } else {
            0.0
        }
    }
}
