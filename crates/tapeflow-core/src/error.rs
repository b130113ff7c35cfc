use std::time::Duration;

use thiserror::Error;

/// errno reported when the tape ran out of space.
pub const ENOSPC: i32 = 28;
/// errno reported for generic I/O failures.
pub const EIO: i32 = 5;
/// Internal error code used when no more specific code is known.
pub const SEINTERNAL: i32 = 666;

#[derive(Debug, Error)]
pub enum TapeflowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not allocate {requested} bytes of memory blocks")]
    OutOfMemory { requested: usize },
    #[error("drive error: {0}")]
    Drive(String),
    #[error("media changer error: {0}")]
    MediaChanger(String),
    #[error("task injector error: {0}")]
    Injector(String),
    #[error("client error: {0}")]
    Client(String),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("checksum mismatch (expected {expected:#010x}, actual {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("size mismatch (expected {expected} bytes, actual {actual} bytes)")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("fseq out of order (expected {expected}, actual {actual})")]
    FseqOutOfOrder { expected: u64, actual: u64 },
    #[error("end of tape reached")]
    EndOfTape,
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TapeflowError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TapeflowError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error once all context layers are peeled off.
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error ends the whole session rather than a single file.
    ///
    /// Per-file problems (bad checksum, short file, cancelled task) are
    /// recoverable; drive, changer and injector failures are not.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self.root(),
            Self::ChecksumMismatch { .. } | Self::SizeMismatch { .. } | Self::Cancelled(_)
        )
    }

    pub fn is_end_of_tape(&self) -> bool {
        match self.root() {
            Self::EndOfTape => true,
            Self::Io(err) => err.raw_os_error() == Some(ENOSPC),
            _ => false,
        }
    }

    /// Numeric code forwarded to the client alongside the message.
    pub fn error_code(&self) -> i32 {
        match self.root() {
            Self::EndOfTape => ENOSPC,
            Self::Io(err) => err.raw_os_error().unwrap_or(EIO),
            Self::ChecksumMismatch { .. } | Self::SizeMismatch { .. } => EIO,
            _ => SEINTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layers_do_not_hide_the_code() {
        let err = TapeflowError::EndOfTape
            .with_context("writing fseq 12")
            .with_context("tape write thread");
        assert_eq!(err.error_code(), ENOSPC);
        assert!(err.is_end_of_tape());
        assert!(err.is_session_fatal());
    }

    #[test]
    fn per_file_errors_are_recoverable() {
        let err = TapeflowError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(!err.is_session_fatal());
        assert_eq!(err.error_code(), EIO);
        assert!(TapeflowError::Drive("dead".into()).is_session_fatal());
        assert_eq!(TapeflowError::Drive("dead".into()).error_code(), SEINTERNAL);
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let err: TapeflowError = std::io::Error::from_raw_os_error(ENOSPC).into();
        assert!(err.is_end_of_tape());
        let err: TapeflowError = std::io::Error::other("boom").into();
        assert_eq!(err.error_code(), EIO);
    }
}
