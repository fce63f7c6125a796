//! Log manager error types.

use std::io;
use thiserror::Error;

use larch_common::Lsn;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error on a log, control, or archive file.
    #[error("log I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Checksum or LSN mismatch while reading a record.
    #[error("corrupt log record at {lsn}: {reason}")]
    Corrupt { lsn: Lsn, reason: String },

    /// Control file contents failed validation.
    #[error("corrupt log anchor: {reason}")]
    AnchorCorrupt { reason: String },

    /// Record exceeds the log buffer size or the usable space in a file.
    #[error("log record too large: {size} bytes exceeds maximum {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// The log is closed, was never started, or has entered the errored
    /// state after a background failure.
    #[error("log is closed or has encountered an error")]
    Closed,

    /// A log file header did not match the anchor.
    #[error("log file {path} has a corrupt or mismatched header")]
    BadFileHeader { path: String },

    /// The LSN does not map onto any online or archived log file.
    #[error("LSN {lsn} does not belong to any log file")]
    InvalidLsn { lsn: Lsn },

    /// Configuration error.
    #[error("log configuration error: {reason}")]
    Config { reason: String },
}

impl LogError {
    /// Creates a corrupt-record error.
    pub fn corrupt(lsn: Lsn, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates an anchor-corruption error.
    pub fn anchor_corrupt(reason: impl Into<String>) -> Self {
        Self::AnchorCorrupt {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::AnchorCorrupt { .. } | Self::BadFileHeader { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_predicate() {
        assert!(LogError::corrupt(Lsn::new(1, 6), "checksum").is_corruption());
        assert!(LogError::anchor_corrupt("bad").is_corruption());
        assert!(!LogError::Closed.is_corruption());
    }

    #[test]
    fn test_io_conversion() {
        let err: LogError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, LogError::Io { .. }));
    }
}
