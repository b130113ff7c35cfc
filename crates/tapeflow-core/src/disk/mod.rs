//! Disk side file access used by the disk worker pools.

use std::path::Path;

use crate::core::sync::catch_panic;
use crate::error::TapeflowError;
use crate::types::Result;

pub mod local;

pub use local::LocalDisk;

/// Opens files on the disk system for the worker pools.
pub trait DiskFileFactory: Send + Sync {
    /// Creates (or truncates) the destination of a recalled file.
    fn create_writer(&self, path: &Path, size: u64) -> Result<Box<dyn DiskFileWriter>>;
    /// Opens the source of a file to migrate.
    fn open_reader(&self, path: &Path) -> Result<Box<dyn DiskFileReader>>;
}

pub trait DiskFileWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Makes the file durable and closes it.
    fn close(self: Box<Self>) -> Result<()>;
    /// Discards the partially written file.
    fn abort(self: Box<Self>);
}

pub trait DiskFileReader: Send {
    fn size(&self) -> u64;
    /// Reads up to `buf.len()` bytes; `Ok(0)` at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Runs a call into a disk back-end. A panic in the back-end becomes an
/// I/O error, which only fails the file being transferred.
pub(crate) fn disk_call<T, F>(what: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    catch_panic(what, f, |message| {
        TapeflowError::Io(std::io::Error::other(message))
    })
}

/// Discards a partial file, logging a back-end failure instead of
/// propagating it.
pub(crate) fn abort_writer(writer: Box<dyn DiskFileWriter>) {
    let aborted = disk_call("disk writer abort", || {
        writer.abort();
        Ok(())
    });
    if let Err(err) = aborted {
        tracing::warn!(error = %err, "could not discard a partially written file");
    }
}
