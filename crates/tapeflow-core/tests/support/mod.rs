#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tapeflow_core::{
    ClientReporter, DiskFileFactory, DiskFileReader, DiskFileWriter, DriveStatus, FileFailure,
    FileReport, LocalDisk, MigrationFile, MigrationJobSource, RecallFile, RecallJobSource, Result,
    SessionConfig, SessionState, SessionType, TapedProxy, TapeflowError, VolumeInfo,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Success(Vec<FileReport>),
    Failure(Vec<FileFailure>),
    EndOfSession,
    EndOfSessionWithError(String, i32),
    DriveStatus(DriveStatus),
    TapeFull,
}

#[derive(Debug, Default)]
pub struct ClientLog {
    pub calls: Vec<ClientCall>,
    /// Success reports fail while this is set.
    pub fail_success: bool,
    /// Success reports panic while this is set.
    pub panic_success: bool,
}

/// Client that records every call; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingClient {
    log: Arc<Mutex<ClientLog>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_success_reports() -> Self {
        let client = Self::default();
        client.log().fail_success = true;
        client
    }

    pub fn panicking_success_reports() -> Self {
        let client = Self::default();
        client.log().panic_success = true;
        client
    }

    pub fn log(&self) -> MutexGuard<'_, ClientLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.log().calls.clone()
    }

    pub fn succeeded(&self) -> Vec<FileReport> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::Success(files) => Some(files),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn failed(&self) -> Vec<FileFailure> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::Failure(files) => Some(files),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn drive_statuses(&self) -> Vec<DriveStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::DriveStatus(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// The end-of-session calls, in order.
    pub fn terminal_calls(&self) -> Vec<ClientCall> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    ClientCall::EndOfSession | ClientCall::EndOfSessionWithError(..)
                )
            })
            .collect()
    }

    pub fn boxed(&self) -> Box<dyn ClientReporter> {
        Box::new(self.clone())
    }
}

impl ClientReporter for RecordingClient {
    fn report_success(&mut self, files: &[FileReport], timeout: Duration) -> Result<()> {
        let mut log = self.log();
        if log.panic_success {
            drop(log);
            panic!("client library crashed while reporting {} files", files.len());
        }
        if log.fail_success {
            return Err(TapeflowError::Timeout {
                operation: "report success",
                timeout,
            });
        }
        log.calls.push(ClientCall::Success(files.to_vec()));
        Ok(())
    }

    fn report_failure(&mut self, files: &[FileFailure], _timeout: Duration) -> Result<()> {
        self.log().calls.push(ClientCall::Failure(files.to_vec()));
        Ok(())
    }

    fn report_end_of_session(&mut self, _timeout: Duration) -> Result<()> {
        self.log().calls.push(ClientCall::EndOfSession);
        Ok(())
    }

    fn report_end_of_session_with_error(
        &mut self,
        message: &str,
        code: i32,
        _timeout: Duration,
    ) -> Result<()> {
        self.log()
            .calls
            .push(ClientCall::EndOfSessionWithError(message.to_string(), code));
        Ok(())
    }

    fn report_drive_status(
        &mut self,
        status: DriveStatus,
        _reason: Option<&str>,
        _timeout: Duration,
    ) -> Result<()> {
        self.log().calls.push(ClientCall::DriveStatus(status));
        Ok(())
    }

    fn report_tape_full(&mut self, _timeout: Duration) -> Result<()> {
        self.log().calls.push(ClientCall::TapeFull);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ProxyLog {
    pub states: Vec<SessionState>,
    pub mounted: usize,
    pub unmounted: usize,
    pub heartbeats: Vec<(u64, u64)>,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingProxy {
    log: Arc<Mutex<ProxyLog>>,
}

impl RecordingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, ProxyLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TapedProxy for RecordingProxy {
    fn report_state(&self, state: SessionState, _session_type: SessionType, _vid: &str) {
        self.log().states.push(state);
    }

    fn tape_mounted(&self, _session_type: SessionType, _vid: &str, _unit: &str) {
        self.log().mounted += 1;
    }

    fn tape_unmounted(&self, _vid: &str, _unit: &str) {
        self.log().unmounted += 1;
    }

    fn report_heartbeat(&self, bytes_moved: u64, blocks_moved: u64) {
        self.log().heartbeats.push((bytes_moved, blocks_moved));
    }

    fn add_log_params(&self, _unit: &str, params: &[(String, String)]) {
        self.log().params.extend_from_slice(params);
    }

    fn delete_log_params(&self, _unit: &str, _names: &[String]) {}
}

/// Hands out pre-built batches, then empty ones.
pub struct BatchSource<F> {
    batches: VecDeque<Vec<F>>,
    fail_after: Option<usize>,
    calls: usize,
}

impl<F> BatchSource<F> {
    pub fn new(batches: Vec<Vec<F>>) -> Self {
        Self {
            batches: batches.into(),
            fail_after: None,
            calls: 0,
        }
    }

    /// Fails every fetch after the first `calls` ones.
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_after = Some(calls);
        self
    }

    fn next(&mut self) -> Result<Vec<F>> {
        self.calls += 1;
        if self.fail_after.is_some_and(|limit| self.calls > limit) {
            return Err(TapeflowError::Client("catalogue unreachable".to_string()));
        }
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

impl RecallJobSource for BatchSource<RecallFile> {
    fn next_batch(&mut self, _max_files: u64, _max_bytes: u64) -> Result<Vec<RecallFile>> {
        self.next()
    }
}

impl MigrationJobSource for BatchSource<MigrationFile> {
    fn next_batch(&mut self, _max_files: u64, _max_bytes: u64) -> Result<Vec<MigrationFile>> {
        self.next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicAt {
    /// Opening the file panics.
    Open,
    /// The second data call on the file panics.
    Data,
}

/// Local disk whose back-end panics on the file named `victim`.
pub struct PanickingDisk {
    inner: LocalDisk,
    victim: String,
    at: PanicAt,
}

impl PanickingDisk {
    pub fn new(victim: &str, at: PanicAt) -> Self {
        Self {
            inner: LocalDisk::new().with_parent_dirs(),
            victim: victim.to_string(),
            at,
        }
    }

    fn targets(&self, path: &Path, at: PanicAt) -> bool {
        self.at == at && path.ends_with(&self.victim)
    }
}

impl DiskFileFactory for PanickingDisk {
    fn create_writer(&self, path: &Path, size: u64) -> Result<Box<dyn DiskFileWriter>> {
        if self.targets(path, PanicAt::Open) {
            panic!("disk back-end crashed creating {}", path.display());
        }
        let writer = self.inner.create_writer(path, size)?;
        if self.targets(path, PanicAt::Data) {
            return Ok(Box::new(CrashingWriter { inner: writer, calls: 0 }));
        }
        Ok(writer)
    }

    fn open_reader(&self, path: &Path) -> Result<Box<dyn DiskFileReader>> {
        if self.targets(path, PanicAt::Open) {
            panic!("disk back-end crashed opening {}", path.display());
        }
        let reader = self.inner.open_reader(path)?;
        if self.targets(path, PanicAt::Data) {
            return Ok(Box::new(CrashingReader { inner: reader, calls: 0 }));
        }
        Ok(reader)
    }
}

struct CrashingWriter {
    inner: Box<dyn DiskFileWriter>,
    calls: usize,
}

impl DiskFileWriter for CrashingWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.calls += 1;
        if self.calls == 2 {
            panic!("disk back-end crashed mid-write");
        }
        self.inner.write(data)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.inner.close()
    }

    fn abort(self: Box<Self>) {
        self.inner.abort();
    }
}

struct CrashingReader {
    inner: Box<dyn DiskFileReader>,
    calls: usize,
}

impl DiskFileReader for CrashingReader {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.calls += 1;
        if self.calls == 2 {
            panic!("disk back-end crashed mid-read");
        }
        self.inner.read(buf)
    }
}

/// Small blocks and fast periods so sessions finish quickly.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        block_size: 64,
        block_count: 16,
        disk_threads: 2,
        report_file_period: 2,
        heartbeat_period: Duration::from_millis(20),
        watchdog_poll_period: Duration::from_millis(5),
        stuck_period: Duration::from_secs(60),
        client_timeout: Duration::from_millis(200),
        tape_load_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

pub fn recall_volume() -> VolumeInfo {
    VolumeInfo::new("V00042", "drive0", "slot7", SessionType::Recall)
}

pub fn migration_volume() -> VolumeInfo {
    VolumeInfo::new("V00042", "drive0", "slot7", SessionType::Migration)
}

/// Deterministic file content of `len` bytes.
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}
