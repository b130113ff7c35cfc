//! Tape hardware seams: the drive that moves data and the library robot
//! that moves cartridges.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Result;

pub mod virtual_drive;

pub use virtual_drive::{VirtualDrive, VirtualFaults, VirtualLibrary};

/// A tape alert flag raised by the drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeAlert {
    pub code: u16,
    pub description: String,
    /// Alerts that make writing unsafe abort a migration before any data moves.
    pub critical_for_write: bool,
}

/// Low level access to one tape drive.
///
/// Files are addressed by fseq. Reading returns one tape block per call and
/// `Ok(0)` once the file mark is reached.
pub trait TapeDrive: Send {
    /// Blocks until the drive reports ready, up to `timeout`.
    fn wait_until_ready(&mut self, timeout: Duration) -> Result<()>;
    fn has_tape_in_place(&mut self) -> Result<bool>;
    fn is_write_protected(&mut self) -> Result<bool>;
    /// Verifies the volume label matches `vid`.
    fn check_label(&mut self, vid: &str) -> Result<()>;
    fn enable_lbp(&mut self) -> Result<()>;
    fn disable_lbp(&mut self) -> Result<()>;
    fn tape_alerts(&mut self) -> Result<Vec<TapeAlert>>;

    fn position_for_read(&mut self, fseq: u64, block_id: Option<u64>) -> Result<()>;
    /// Reads the next tape block of the current file into `buf`.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Moves to the end of data, which must be right after `last_fseq`.
    fn position_for_write(&mut self, last_fseq: u64) -> Result<()>;
    fn start_file(&mut self, fseq: u64) -> Result<()>;
    fn write_block(&mut self, data: &[u8]) -> Result<()>;
    /// Writes the trailing file mark of the current file.
    fn close_file(&mut self) -> Result<()>;
    /// Makes everything written so far durable on the medium.
    fn flush(&mut self) -> Result<()>;
    fn unload(&mut self) -> Result<()>;
}

/// The library robot that moves cartridges between slots and drives.
pub trait MediaChanger: Send {
    fn mount(&mut self, vid: &str, slot: &str, read_only: bool) -> Result<()>;
    fn dismount(&mut self, vid: &str, slot: &str) -> Result<()>;
}
