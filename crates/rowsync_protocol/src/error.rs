//! Error types for the sync protocol.

use rowsync_core::{RowKey, TableName};
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur in the sync protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A resolver produced a merged row that fails table validation.
    #[error("invalid merge result for {table} {key}: {reason}")]
    InvalidMergeResult {
        /// Table of the conflicting row.
        table: TableName,
        /// Key of the conflicting row.
        key: RowKey,
        /// Validation failure.
        reason: String,
    },

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}
