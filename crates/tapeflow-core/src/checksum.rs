use serde::{Deserialize, Serialize};

const ADLER_MOD: u32 = 65_521;
// Largest n such that 255n(n+1)/2 + (n+1)(ADLER_MOD-1) fits in a u32.
const ADLER_NMAX: usize = 5_552;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChecksumAlgo {
    #[default]
    None,
    Crc32,
    Adler32,
}

/// Incremental checksum fed block by block as data crosses the pipeline.
#[derive(Debug, Clone)]
pub struct Checksum {
    state: State,
}

#[derive(Debug, Clone)]
enum State {
    None,
    Crc32(crc32fast::Hasher),
    Adler32 { a: u32, b: u32 },
}

impl Checksum {
    pub fn new(algo: ChecksumAlgo) -> Self {
        let state = match algo {
            ChecksumAlgo::None => State::None,
            ChecksumAlgo::Crc32 => State::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgo::Adler32 => State::Adler32 { a: 1, b: 0 },
        };
        Self { state }
    }

    pub fn algo(&self) -> ChecksumAlgo {
        match self.state {
            State::None => ChecksumAlgo::None,
            State::Crc32(_) => ChecksumAlgo::Crc32,
            State::Adler32 { .. } => ChecksumAlgo::Adler32,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::None => {}
            State::Crc32(hasher) => hasher.update(data),
            State::Adler32 { a, b } => {
                for chunk in data.chunks(ADLER_NMAX) {
                    for &byte in chunk {
                        *a += u32::from(byte);
                        *b += *a;
                    }
                    *a %= ADLER_MOD;
                    *b %= ADLER_MOD;
                }
            }
        }
    }

    /// Final value; always zero for [`ChecksumAlgo::None`].
    pub fn finalize(self) -> u32 {
        match self.state {
            State::None => 0,
            State::Crc32(hasher) => hasher.finalize(),
            State::Adler32 { a, b } => (b << 16) | a,
        }
    }
}

/// One-shot checksum of a complete buffer.
pub fn checksum_of(algo: ChecksumAlgo, data: &[u8]) -> u32 {
    let mut checksum = Checksum::new(algo);
    checksum.update(data);
    checksum.finalize()
}
