use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgo;
use crate::error::TapeflowError;

pub type Result<T> = std::result::Result<T, TapeflowError>;

/// A file to be read from tape and written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallFile {
    pub file_id: u64,
    /// Position of the file on the tape, starting at 1.
    pub fseq: u64,
    /// Logical block id of the file header, when the catalogue knows it.
    pub block_id: Option<u64>,
    pub size: u64,
    pub disk_path: PathBuf,
    pub checksum_algo: ChecksumAlgo,
    /// Checksum recorded when the file was migrated.
    pub expected_checksum: Option<u32>,
}

impl RecallFile {
    pub fn new(file_id: u64, fseq: u64, size: u64, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            file_id,
            fseq,
            block_id: None,
            size,
            disk_path: disk_path.into(),
            checksum_algo: ChecksumAlgo::None,
            expected_checksum: None,
        }
    }

    pub fn with_checksum(mut self, algo: ChecksumAlgo, expected: u32) -> Self {
        self.checksum_algo = algo;
        self.expected_checksum = Some(expected);
        self
    }
}

/// A file to be read from disk and appended to tape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFile {
    pub file_id: u64,
    /// Destination position on the tape; must follow the previous file.
    pub fseq: u64,
    pub size: u64,
    pub disk_path: PathBuf,
    pub checksum_algo: ChecksumAlgo,
}

impl MigrationFile {
    pub fn new(file_id: u64, fseq: u64, size: u64, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            file_id,
            fseq,
            size,
            disk_path: disk_path.into(),
            checksum_algo: ChecksumAlgo::Adler32,
        }
    }
}

/// Successful transfer of one file, as forwarded to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub file_id: u64,
    pub fseq: u64,
    pub size: u64,
    pub checksum_algo: ChecksumAlgo,
    pub checksum: u32,
}

/// Failed transfer of one file, as forwarded to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub file_id: u64,
    pub fseq: u64,
    pub message: String,
    pub code: i32,
}

impl FileFailure {
    pub fn from_error(file_id: u64, fseq: u64, error: &TapeflowError) -> Self {
        Self {
            file_id,
            fseq,
            message: error.to_string(),
            code: error.error_code(),
        }
    }
}

/// Drive states published to the client while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveStatus {
    Up,
    Down,
    Mounting,
    Transferring,
    CleaningUp,
    Unloading,
    Unmounting,
}

impl DriveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "Up",
            Self::Down => "Down",
            Self::Mounting => "Mounting",
            Self::Transferring => "Transferring",
            Self::CleaningUp => "CleaningUp",
            Self::Unloading => "Unloading",
            Self::Unmounting => "Unmounting",
        }
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    Recall,
    Migration,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recall => "recall",
            Self::Migration => "migration",
        }
    }
}

/// Session lifecycle states published to the supervising process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Mounting,
    Running,
    Unmounting,
    ShuttingDown,
}

/// Identity of the mounted tape and the drive serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub vid: String,
    pub drive_unit: String,
    pub library_slot: String,
    pub session_type: SessionType,
}

impl VolumeInfo {
    pub fn new(
        vid: impl Into<String>,
        drive_unit: impl Into<String>,
        library_slot: impl Into<String>,
        session_type: SessionType,
    ) -> Self {
        Self {
            vid: vid.into(),
            drive_unit: drive_unit.into(),
            library_slot: library_slot.into(),
            session_type,
        }
    }
}

/// What the supervisor should do with the drive once the session is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndOfSessionAction {
    MarkDriveUp,
    MarkDriveDown,
}
