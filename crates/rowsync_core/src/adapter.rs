//! The change tracking adapter contract.
//!
//! An adapter wraps one concrete data store and exposes exactly the
//! operations the sync engine needs: selecting rows changed after a
//! checkpoint, reading a single row, and applying a row with an optimistic
//! precondition. The engine never talks to a store any other way.

use crate::error::AdapterResult;
use crate::row::{RowKey, TrackedRow};
use crate::schema::TableName;
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

/// Why a single row could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailureKind {
    /// A unique constraint other than the primary key was violated.
    UniqueKeyConstraint,
    /// Any other store-side rejection.
    Other,
}

/// A row-level failure reported by [`ChangeTrackingAdapter::apply_row`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyFailure {
    /// Failure category.
    pub kind: ApplyFailureKind,
    /// Store-provided reason.
    pub reason: String,
}

impl ApplyFailure {
    /// Creates a unique-constraint failure.
    pub fn unique_key(reason: impl Into<String>) -> Self {
        Self {
            kind: ApplyFailureKind::UniqueKeyConstraint,
            reason: reason.into(),
        }
    }

    /// Creates a generic failure.
    pub fn other(reason: impl Into<String>) -> Self {
        Self {
            kind: ApplyFailureKind::Other,
            reason: reason.into(),
        }
    }
}

/// Result of applying a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The row was written (or the tombstone recorded).
    Applied,
    /// The stored row no longer matches the expected prior timestamp.
    /// Carries the current stored row, if any.
    Conflicted(Option<TrackedRow>),
    /// The store rejected the row.
    Failed(ApplyFailure),
}

/// Access to a change-tracked data store.
///
/// Implementations assign a fresh value of their own logical clock to every
/// write they perform, including writes made through [`apply_row`], and
/// record the `update_scope_id` they are given so that a participant never
/// receives its own writes back.
///
/// [`apply_row`]: ChangeTrackingAdapter::apply_row
#[async_trait]
pub trait ChangeTrackingAdapter: Send + Sync {
    /// Streams rows of `table` whose `update_timestamp` is greater than
    /// `since` (every row when `since` is `None`), tombstones included,
    /// skipping rows last written by `exclude_origin`.
    ///
    /// Rows are yielded in ascending `update_timestamp` order.
    async fn select_changes(
        &self,
        table: &TableName,
        since: Option<u64>,
        exclude_origin: Option<Uuid>,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<TrackedRow>>>;

    /// Reads a row (live or tombstone) by primary key.
    async fn get_row(&self, table: &TableName, key: &RowKey) -> AdapterResult<Option<TrackedRow>>;

    /// Writes `row`, or records its deletion if it is a tombstone.
    ///
    /// The write only happens if the stored row's `update_timestamp` still
    /// equals `expected_prior` (`None` meaning "no stored row"). The given
    /// `update_scope_id` is stored as-is; the timestamp is reassigned.
    async fn apply_row(
        &self,
        table: &TableName,
        row: &TrackedRow,
        expected_prior: Option<u64>,
    ) -> AdapterResult<ApplyOutcome>;

    /// Returns the current value of the store's logical clock.
    async fn local_timestamp(&self) -> AdapterResult<u64>;

    /// Removes tombstones of `table` with `update_timestamp < older_than`.
    /// Returns the number of tombstones removed.
    async fn purge_tombstones(&self, table: &TableName, older_than: u64) -> AdapterResult<u64>;

    /// Removes every row and tombstone of `table`.
    async fn reset_table(&self, table: &TableName) -> AdapterResult<()>;
}
