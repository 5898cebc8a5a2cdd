//! Error types for RowSync core.

use crate::scope::ScopeRole;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in RowSync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No scope is stored under the given name and role.
    #[error("scope not found: {name} ({role:?})")]
    ScopeNotFound {
        /// Scope name.
        name: String,
        /// Scope role.
        role: ScopeRole,
    },

    /// The stored scope changed since it was read.
    #[error("concurrency conflict on scope {name}: expected revision {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Scope name.
        name: String,
        /// Revision the caller read.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },

    /// The scope store cannot be reached.
    #[error("scope store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// Foreign keys between tables form a cycle.
    #[error("foreign key cycle between tables: {}", tables.join(", "))]
    SchemaCycle {
        /// Tables participating in the cycle.
        tables: Vec<String>,
    },

    /// Two schemas cannot be reconciled by provisioning.
    #[error("schema incompatible for table {table}: {reason}")]
    SchemaIncompatible {
        /// The offending table.
        table: String,
        /// Why the change cannot be reconciled.
        reason: String,
    },

    /// A table or schema definition is malformed.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// A row does not satisfy its table definition.
    #[error("invalid row for table {table}: {message}")]
    InvalidRow {
        /// Table name.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CoreError {
    /// Creates a store-unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates an invalid-schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates an invalid-row error.
    pub fn invalid_row(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRow {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a schema-incompatible error.
    pub fn schema_incompatible(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaIncompatible {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Classification of adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// The operation may succeed if retried (connection reset, lock timeout).
    Transient,
    /// Retrying will not help.
    Permanent,
}

/// Error raised by a change tracking adapter or provisioning manager.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} adapter error: {message}")]
pub struct AdapterError {
    /// Whether the failure is transient.
    pub kind: AdapterErrorKind,
    /// Description of the failure.
    pub message: String,
}

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

impl AdapterError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns true if the operation can be retried.
    pub fn is_transient(&self) -> bool {
        self.kind == AdapterErrorKind::Transient
    }
}
