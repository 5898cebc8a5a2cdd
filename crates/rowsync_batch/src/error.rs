//! Error types for the batch engine.

use rowsync_core::CoreError;
use std::io;
use thiserror::Error;

/// Result type for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors that can occur while writing or reading batches.
#[derive(Debug, Error)]
pub enum BatchError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A part file does not match the checksum recorded when it was sealed.
    #[error("checksum mismatch for {file}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// Part file name.
        file: String,
        /// Recorded checksum.
        expected: String,
        /// Checksum of the file on disk.
        actual: String,
    },

    /// A declared part file is not on disk.
    #[error("missing batch part: {file}")]
    MissingPart {
        /// Part file name.
        file: String,
    },

    /// The batch was never finished or its last part is missing.
    #[error("incomplete batch: {reason}")]
    Incomplete {
        /// What is missing.
        reason: String,
    },

    /// Schema error (dependency ordering).
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl BatchError {
    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    pub(crate) fn incomplete(reason: impl Into<String>) -> Self {
        Self::Incomplete {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_display() {
        let err = BatchError::ChecksumMismatch {
            file: "part_000001.cbor".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch for part_000001.cbor: expected aa, found bb"
        );
    }
}
