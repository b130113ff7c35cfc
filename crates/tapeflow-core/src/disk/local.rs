use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::disk::{DiskFileFactory, DiskFileReader, DiskFileWriter};
use crate::error::TapeflowError;
use crate::types::Result;

/// Disk files on a locally mounted filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDisk {
    create_parent_dirs: bool,
}

impl LocalDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates missing parent directories of recalled files.
    pub fn with_parent_dirs(mut self) -> Self {
        self.create_parent_dirs = true;
        self
    }
}

impl DiskFileFactory for LocalDisk {
    fn create_writer(&self, path: &Path, _size: u64) -> Result<Box<dyn DiskFileWriter>> {
        if let Some(parent) = path.parent().filter(|_| self.create_parent_dirs) {
            fs::create_dir_all(parent).map_err(|err| {
                TapeflowError::Io(err).with_context(format!("creating {}", parent.display()))
            })?;
        }
        let file = File::create(path).map_err(|err| {
            TapeflowError::Io(err).with_context(format!("creating {}", path.display()))
        })?;
        Ok(Box::new(LocalWriter {
            file,
            path: path.to_path_buf(),
        }))
    }

    fn open_reader(&self, path: &Path) -> Result<Box<dyn DiskFileReader>> {
        let file = File::open(path).map_err(|err| {
            TapeflowError::Io(err).with_context(format!("opening {}", path.display()))
        })?;
        let size = file.metadata()?.len();
        Ok(Box::new(LocalReader { file, size }))
    }
}

struct LocalWriter {
    file: File,
    path: PathBuf,
}

impl DiskFileWriter for LocalWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let Self { file, path } = *self;
        drop(file);
        if let Err(err) = fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove aborted file");
        }
    }
}

struct LocalReader {
    file: File,
    size: u64,
}

impl DiskFileReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }
}
