//! Error types for the sync server.

use rowsync_batch::BatchError;
use rowsync_core::{AdapterError, CoreError};
use rowsync_engine::SyncError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// No server scope is registered under the name.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// The session was never opened or already ended.
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// The client already has a live session on the scope.
    #[error("client {client_id} already has a session in progress for scope {scope}")]
    SessionAlreadyInProgress {
        /// Scope name.
        scope: String,
        /// Client participant id.
        client_id: Uuid,
    },

    /// Protocol version mismatch.
    #[error("protocol version mismatch: server speaks {expected}, client sent {actual}")]
    ProtocolVersion {
        /// Version the server speaks.
        expected: u16,
        /// Version the client sent.
        actual: u16,
    },

    /// Scope store or model error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Batch error.
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Data store error.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Change selection or application failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::UnknownScope(_)
                | ServerError::UnknownSession(_)
                | ServerError::SessionAlreadyInProgress { .. }
                | ServerError::ProtocolVersion { .. }
                | ServerError::Sync(
                    SyncError::SchemaIncompatible { .. } | SyncError::Cancelled
                )
        )
    }

    /// Returns true if the server failed to process a valid request.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns true if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Core(CoreError::StoreUnavailable { .. }) => true,
            ServerError::Adapter(e) => e.is_transient(),
            ServerError::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<ServerError> for SyncError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::SessionAlreadyInProgress { scope, .. } => {
                SyncError::SessionAlreadyInProgress { scope }
            }
            ServerError::Sync(
                e @ (SyncError::SchemaCycle { .. }
                | SyncError::SchemaIncompatible { .. }
                | SyncError::Cancelled),
            ) => e,
            other => SyncError::Server {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}
