//! Error types for the sync engine.

use rowsync_batch::BatchError;
use rowsync_core::{AdapterError, CoreError};
use rowsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Scope store or model error.
    #[error("core error: {0}")]
    Core(CoreError),

    /// Batch error.
    #[error("batch error: {0}")]
    Batch(BatchError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Change tracking adapter or provisioning error.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Another live session owns the scope.
    #[error("a session is already in progress for scope {scope}")]
    SessionAlreadyInProgress {
        /// Scope name.
        scope: String,
    },

    /// The server schema cannot be reconciled with the provisioned one.
    #[error("schema incompatible for table {table}: {reason}")]
    SchemaIncompatible {
        /// The offending table.
        table: String,
        /// Why the change cannot be reconciled.
        reason: String,
    },

    /// Foreign keys form a cycle and the cycle policy forbids it.
    #[error("foreign key cycle between tables: {}", tables.join(", "))]
    SchemaCycle {
        /// Tables participating in the cycle.
        tables: Vec<String>,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Server rejected the request.
    #[error("server error: {message}")]
    Server {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A transport call exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid stage transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current stage.
        from: String,
        /// Attempted target stage.
        to: String,
    },

    /// A background task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } | SyncError::Server { retryable, .. } => {
                *retryable
            }
            SyncError::Timeout => true,
            SyncError::Adapter(e) => e.is_transient(),
            SyncError::Core(CoreError::StoreUnavailable { .. }) => true,
            _ => false,
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::SchemaCycle { tables } => SyncError::SchemaCycle { tables },
            CoreError::SchemaIncompatible { table, reason } => {
                SyncError::SchemaIncompatible { table, reason }
            }
            other => SyncError::Core(other),
        }
    }
}

impl From<BatchError> for SyncError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Core(inner) => inner.into(),
            other => SyncError::Batch(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::from(AdapterError::transient("lock timeout")).is_retryable());
        assert!(!SyncError::from(AdapterError::permanent("no such table")).is_retryable());
        assert!(SyncError::from(CoreError::store_unavailable("busy")).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::SessionAlreadyInProgress {
            scope: "default".into()
        }
        .is_retryable());
    }

    #[test]
    fn schema_errors_are_lifted() {
        let err = SyncError::from(CoreError::SchemaCycle {
            tables: vec!["a".into(), "b".into()],
        });
        assert!(matches!(err, SyncError::SchemaCycle { .. }));
        assert_eq!(err.to_string(), "foreign key cycle between tables: a, b");

        let err = SyncError::from(BatchError::Core(CoreError::schema_incompatible(
            "people",
            "primary key changed",
        )));
        assert!(matches!(err, SyncError::SchemaIncompatible { ref table, .. } if table == "people"));
    }

    #[test]
    fn error_display() {
        let err = SyncError::InvalidStateTransition {
            from: "None".into(),
            to: "EndSession".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from None to EndSession"
        );
    }
}
