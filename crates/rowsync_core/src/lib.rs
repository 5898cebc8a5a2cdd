//! # RowSync Core
//!
//! Shared model for the RowSync synchronization engine.
//!
//! This crate provides:
//! - Schema model with foreign-key dependency ordering and schema diffs
//! - Row values and per-row tracking metadata
//! - The logical clock every tracked store advances on write
//! - Scopes, server history and the [`ScopeStore`] contract (memory and file)
//! - The [`ChangeTrackingAdapter`] and [`ProvisioningManager`] contracts
//!
//! ## Key Invariants
//!
//! - Every write to a tracked row assigns a strictly greater `update_timestamp`
//! - A row written on behalf of participant P carries `update_scope_id = P`
//! - A scope is saved only at the revision it was read at

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod clock;
mod error;
mod provision;
mod row;
mod schema;
mod scope;

pub use adapter::{ApplyFailure, ApplyFailureKind, ApplyOutcome, ChangeTrackingAdapter};
pub use clock::LogicalClock;
pub use error::{AdapterError, AdapterErrorKind, AdapterResult, CoreError, CoreResult};
pub use provision::ProvisioningManager;
pub use row::{Row, RowKey, TrackedRow, TrackingMetadata, Value};
pub use schema::{
    Column, ColumnType, CyclePolicy, ForeignKey, Schema, SchemaDiff, SyncDirection, Table,
    TableChange, TableName,
};
pub use scope::{
    FileScopeStore, HistoryEntry, MemoryScopeStore, Scope, ScopeRole, ScopeStore, SessionClaim,
    SessionOutcome, SyncType,
};
