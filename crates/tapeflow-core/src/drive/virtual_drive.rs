use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::sync::lock_unpoisoned;
use crate::drive::{MediaChanger, TapeAlert, TapeDrive};
use crate::error::TapeflowError;
use crate::types::Result;

/// Failures a [`VirtualDrive`] can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct VirtualFaults {
    pub fail_mount: bool,
    pub fail_load: bool,
    pub fail_position_at_fseq: Option<u64>,
    pub fail_read_at_fseq: Option<u64>,
    pub panic_on_read_at_fseq: Option<u64>,
    pub fail_write_at_fseq: Option<u64>,
    pub fail_flush: bool,
    pub fail_unload: bool,
    pub fail_dismount: bool,
    pub write_protected: bool,
    /// Bytes the cartridge can hold before writes hit end of tape.
    pub capacity_bytes: Option<u64>,
    pub alerts: Vec<TapeAlert>,
    /// Delay applied to every block read or written.
    pub block_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Cartridge {
    vid: String,
    files: BTreeMap<u64, Vec<Vec<u8>>>,
    bytes: u64,
    durable_fseq: u64,
}

#[derive(Debug, Default)]
struct DriveState {
    cartridge: Cartridge,
    in_drive: bool,
    loaded: bool,
    lbp: bool,
    read_cursor: Option<(u64, usize)>,
    writing: Option<u64>,
    end_of_data: u64,
    faults: VirtualFaults,
    mounts: usize,
    dismounts: usize,
    unloads: usize,
    flushes: usize,
}

/// In-memory tape drive holding a single cartridge.
///
/// Clones share the same drive, so a test can keep one handle for
/// inspection while the session owns another.
#[derive(Debug, Clone, Default)]
pub struct VirtualDrive {
    state: Arc<Mutex<DriveState>>,
}

impl VirtualDrive {
    /// A drive whose cartridge `vid` is blank.
    pub fn new(vid: impl Into<String>) -> Self {
        let drive = Self::default();
        drive.lock().cartridge.vid = vid.into();
        drive
    }

    /// A drive whose cartridge already holds `files`, split into tape
    /// blocks of `block_size` bytes. Files are durable.
    pub fn with_files(
        vid: impl Into<String>,
        block_size: usize,
        files: impl IntoIterator<Item = (u64, Vec<u8>)>,
    ) -> Self {
        let drive = Self::new(vid);
        {
            let mut state = drive.lock();
            for (fseq, data) in files {
                let blocks = data
                    .chunks(block_size.max(1))
                    .map(<[u8]>::to_vec)
                    .collect();
                state.cartridge.bytes += data.len() as u64;
                state.cartridge.files.insert(fseq, blocks);
                state.end_of_data = state.end_of_data.max(fseq);
            }
            state.cartridge.durable_fseq = state.end_of_data;
        }
        drive
    }

    pub fn set_faults(&self, faults: VirtualFaults) {
        self.lock().faults = faults;
    }

    /// The robot serving this drive.
    pub fn library(&self) -> VirtualLibrary {
        VirtualLibrary {
            state: Arc::clone(&self.state),
        }
    }

    /// Content of file `fseq`, block boundaries removed.
    pub fn file(&self, fseq: u64) -> Option<Vec<u8>> {
        self.lock()
            .cartridge
            .files
            .get(&fseq)
            .map(|blocks| blocks.concat())
    }

    pub fn file_count(&self) -> usize {
        self.lock().cartridge.files.len()
    }

    /// Highest fseq made durable by a flush.
    pub fn durable_fseq(&self) -> u64 {
        self.lock().cartridge.durable_fseq
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    pub fn unload_count(&self) -> usize {
        self.lock().unloads
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    pub fn lbp_enabled(&self) -> bool {
        self.lock().lbp
    }

    fn lock(&self) -> MutexGuard<'_, DriveState> {
        lock_unpoisoned(&self.state)
    }
}

fn medium_error(message: String) -> TapeflowError {
    TapeflowError::Io(std::io::Error::other(message))
}

impl TapeDrive for VirtualDrive {
    fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let state = self.lock();
        if state.in_drive && state.faults.fail_load {
            return Err(TapeflowError::Timeout {
                operation: "wait for drive ready",
                timeout,
            });
        }
        Ok(())
    }

    fn has_tape_in_place(&mut self) -> Result<bool> {
        Ok(self.lock().in_drive)
    }

    fn is_write_protected(&mut self) -> Result<bool> {
        Ok(self.lock().faults.write_protected)
    }

    fn check_label(&mut self, vid: &str) -> Result<()> {
        let state = self.lock();
        if !state.loaded {
            return Err(TapeflowError::Drive("no tape loaded".to_string()));
        }
        if state.cartridge.vid != vid {
            return Err(TapeflowError::Drive(format!(
                "label mismatch: expected {vid}, found {}",
                state.cartridge.vid
            )));
        }
        Ok(())
    }

    fn enable_lbp(&mut self) -> Result<()> {
        self.lock().lbp = true;
        Ok(())
    }

    fn disable_lbp(&mut self) -> Result<()> {
        self.lock().lbp = false;
        Ok(())
    }

    fn tape_alerts(&mut self) -> Result<Vec<TapeAlert>> {
        Ok(self.lock().faults.alerts.clone())
    }

    fn position_for_read(&mut self, fseq: u64, _block_id: Option<u64>) -> Result<()> {
        let mut state = self.lock();
        if state.faults.fail_position_at_fseq == Some(fseq) {
            return Err(TapeflowError::Drive(format!(
                "failed to position to fseq {fseq}"
            )));
        }
        if !state.cartridge.files.contains_key(&fseq) {
            return Err(TapeflowError::Drive(format!(
                "fseq {fseq} not found on {}",
                state.cartridge.vid
            )));
        }
        state.read_cursor = Some((fseq, 0));
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (read, pause) = {
            let mut state = self.lock();
            let (fseq, index) = state
                .read_cursor
                .ok_or_else(|| TapeflowError::Drive("read without positioning".to_string()))?;
            if state.faults.panic_on_read_at_fseq == Some(fseq) {
                drop(state);
                panic!("virtual drive panicked reading fseq {fseq}");
            }
            if state.faults.fail_read_at_fseq == Some(fseq) {
                return Err(medium_error(format!("medium error reading fseq {fseq}")));
            }
            let block = state
                .cartridge
                .files
                .get(&fseq)
                .and_then(|blocks| blocks.get(index))
                .cloned();
            match block {
                Some(block) => {
                    if block.len() > buf.len() {
                        return Err(TapeflowError::Drive(format!(
                            "tape block of {} bytes does not fit a {} byte buffer",
                            block.len(),
                            buf.len()
                        )));
                    }
                    buf[..block.len()].copy_from_slice(&block);
                    state.read_cursor = Some((fseq, index + 1));
                    (block.len(), state.faults.block_delay)
                }
                None => (0, None),
            }
        };
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
        Ok(read)
    }

    fn position_for_write(&mut self, last_fseq: u64) -> Result<()> {
        let state = self.lock();
        if state.end_of_data != last_fseq {
            return Err(TapeflowError::Drive(format!(
                "end of data is after fseq {}, expected {last_fseq}",
                state.end_of_data
            )));
        }
        Ok(())
    }

    fn start_file(&mut self, fseq: u64) -> Result<()> {
        let mut state = self.lock();
        let expected = state.end_of_data + 1;
        if fseq != expected {
            return Err(TapeflowError::FseqOutOfOrder {
                expected,
                actual: fseq,
            });
        }
        state.cartridge.files.insert(fseq, Vec::new());
        state.writing = Some(fseq);
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<()> {
        let pause = {
            let mut state = self.lock();
            let fseq = state
                .writing
                .ok_or_else(|| TapeflowError::Drive("write outside of a file".to_string()))?;
            if state.faults.fail_write_at_fseq == Some(fseq) {
                return Err(medium_error(format!("medium error writing fseq {fseq}")));
            }
            let written = state.cartridge.bytes + data.len() as u64;
            if state
                .faults
                .capacity_bytes
                .is_some_and(|capacity| written > capacity)
            {
                return Err(TapeflowError::EndOfTape);
            }
            state.cartridge.bytes = written;
            if let Some(blocks) = state.cartridge.files.get_mut(&fseq) {
                blocks.push(data.to_vec());
            }
            state.faults.block_delay
        };
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        let mut state = self.lock();
        let fseq = state
            .writing
            .take()
            .ok_or_else(|| TapeflowError::Drive("no file open for writing".to_string()))?;
        state.end_of_data = fseq;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.faults.fail_flush {
            return Err(TapeflowError::Drive("flush failed".to_string()));
        }
        state.cartridge.durable_fseq = state.end_of_data;
        state.flushes += 1;
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.faults.fail_unload {
            return Err(TapeflowError::Drive("unload failed".to_string()));
        }
        state.loaded = false;
        state.read_cursor = None;
        state.unloads += 1;
        Ok(())
    }
}

/// Library robot bound to one [`VirtualDrive`].
#[derive(Debug, Clone)]
pub struct VirtualLibrary {
    state: Arc<Mutex<DriveState>>,
}

impl VirtualLibrary {
    pub fn mount_count(&self) -> usize {
        lock_unpoisoned(&self.state).mounts
    }

    pub fn dismount_count(&self) -> usize {
        lock_unpoisoned(&self.state).dismounts
    }
}

impl MediaChanger for VirtualLibrary {
    fn mount(&mut self, vid: &str, slot: &str, _read_only: bool) -> Result<()> {
        let mut state = lock_unpoisoned(&self.state);
        if state.faults.fail_mount {
            return Err(TapeflowError::MediaChanger(format!(
                "robot failed to mount {vid} from {slot}"
            )));
        }
        if state.cartridge.vid != vid {
            return Err(TapeflowError::MediaChanger(format!(
                "cartridge {vid} not found in {slot}"
            )));
        }
        state.in_drive = true;
        state.loaded = true;
        state.mounts += 1;
        Ok(())
    }

    fn dismount(&mut self, vid: &str, slot: &str) -> Result<()> {
        let mut state = lock_unpoisoned(&self.state);
        if state.faults.fail_dismount {
            return Err(TapeflowError::MediaChanger(format!(
                "robot failed to return {vid} to {slot}"
            )));
        }
        state.in_drive = false;
        state.loaded = false;
        state.dismounts += 1;
        Ok(())
    }
}
