//! Conflict detection and resolution.
//!
//! Applying a row received from the other participant goes through
//! [`ConflictEngine::decide`]:
//!
//! 1. The (local, remote) pair is classified by presence and tombstone
//!    state into one of the [`ConflictType`]s.
//! 2. Pairs where at most one side holds a row that needs writing are
//!    skipped or applied directly.
//! 3. Pairs where both sides hold a row are a true conflict only if both
//!    changed since their checkpoint. Only true conflicts reach the
//!    policy or the caller-supplied [`ConflictResolver`].

use crate::error::{ProtocolError, ProtocolResult};
use rowsync_core::{Row, RowKey, Table, TableName, TrackedRow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Classification of a (local, remote) row pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// Both sides hold a live row.
    RemoteExistsLocalExists,
    /// Both sides hold a tombstone.
    RemoteIsDeletedLocalIsDeleted,
    /// Only the remote side holds a live row.
    RemoteExistsLocalNotExists,
    /// Only the local side holds a live row.
    RemoteNotExistsLocalExists,
    /// Remote live, local deleted.
    RemoteExistsLocalIsDeleted,
    /// Remote deleted, local live.
    RemoteIsDeletedLocalExists,
    /// Neither side holds a live row and the local side has no tombstone to
    /// match a remote one.
    RemoteIsDeletedLocalNotExists,
    /// Writing the row violated a uniqueness constraint.
    UniqueKeyConstraint,
    /// The adapter failed while applying the row.
    ErrorsOccurred,
}

impl ConflictType {
    /// Returns true for apply-time failures, which are reported and never
    /// resolved automatically.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConflictType::UniqueKeyConstraint | ConflictType::ErrorsOccurred
        )
    }

    /// Returns true if both sides hold a row, so the pair may be a true
    /// conflict depending on checkpoints.
    pub fn is_two_sided(&self) -> bool {
        matches!(
            self,
            ConflictType::RemoteExistsLocalExists
                | ConflictType::RemoteExistsLocalIsDeleted
                | ConflictType::RemoteIsDeletedLocalExists
        )
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RowState {
    Absent,
    Live,
    Tombstone,
}

impl RowState {
    fn of(row: Option<&TrackedRow>) -> Self {
        match row {
            None => RowState::Absent,
            Some(r) if r.is_tombstone() => RowState::Tombstone,
            Some(_) => RowState::Live,
        }
    }
}

/// Classifies a row pair by presence and tombstone state.
pub fn classify(local: Option<&TrackedRow>, remote: Option<&TrackedRow>) -> ConflictType {
    use RowState::{Absent, Live, Tombstone};
    match (RowState::of(local), RowState::of(remote)) {
        (Live, Live) => ConflictType::RemoteExistsLocalExists,
        (Tombstone, Tombstone) => ConflictType::RemoteIsDeletedLocalIsDeleted,
        (Absent, Live) => ConflictType::RemoteExistsLocalNotExists,
        (Live, Absent) => ConflictType::RemoteNotExistsLocalExists,
        (Tombstone, Live) => ConflictType::RemoteExistsLocalIsDeleted,
        (Live, Tombstone) => ConflictType::RemoteIsDeletedLocalExists,
        (Absent, Absent) | (Absent, Tombstone) | (Tombstone, Absent) => {
            ConflictType::RemoteIsDeletedLocalNotExists
        }
    }
}

/// Checkpoints the applying side compares tracking metadata against.
///
/// `local` is in the applying store's clock, `remote` in the sending
/// store's clock. `None` means the participants never synchronized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    /// Last synchronized value of the applying store's clock.
    pub local: Option<u64>,
    /// Last synchronized value of the sending store's clock.
    pub remote: Option<u64>,
}

impl Checkpoints {
    /// Creates checkpoints.
    pub fn new(local: Option<u64>, remote: Option<u64>) -> Self {
        Self { local, remote }
    }

    /// Returns true if both rows changed since the last synchronization.
    ///
    /// A local row last written on behalf of `remote_id` came from the
    /// remote participant and does not count as a local change.
    pub fn both_changed(&self, local: &TrackedRow, remote: &TrackedRow, remote_id: Uuid) -> bool {
        local.metadata.changed_since(self.local)
            && !local.metadata.written_by(remote_id)
            && remote.metadata.changed_since(self.remote)
    }
}

/// Which participant is applying rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// The client applies rows downloaded from the server.
    Client,
    /// The server applies rows uploaded by a client.
    Server,
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// The remote row overwrites the local one.
    RemoteWins,
    /// The local row is kept and re-stamped so that it propagates.
    LocalWins,
    /// A merged row replaces both.
    MergedRow(Row),
    /// Left for the caller to inspect.
    Unresolved,
}

/// Policy for resolving true conflicts without a resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Server always wins.
    #[default]
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Manual resolution required.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Returns the resolution this policy picks on the applying `side`.
    pub fn resolution_for(&self, side: Side) -> Resolution {
        match (self, side) {
            (ConflictPolicy::ServerWins, Side::Client)
            | (ConflictPolicy::ClientWins, Side::Server) => Resolution::RemoteWins,
            (ConflictPolicy::ServerWins, Side::Server)
            | (ConflictPolicy::ClientWins, Side::Client) => Resolution::LocalWins,
            (ConflictPolicy::Manual, _) => Resolution::Unresolved,
        }
    }
}

/// A pair of divergent row states for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Table of the row.
    pub table: TableName,
    /// Primary key of the row.
    pub key: RowKey,
    /// Classification.
    pub conflict_type: ConflictType,
    /// Row state on the applying side.
    pub local: Option<TrackedRow>,
    /// Row state proposed by the other side.
    pub remote: Option<TrackedRow>,
    /// Resolution outcome.
    pub resolution: Resolution,
    /// Failure or validation detail.
    pub reason: Option<String>,
}

impl Conflict {
    /// Creates an unresolved conflict.
    pub fn new(
        table: TableName,
        key: RowKey,
        conflict_type: ConflictType,
        local: Option<TrackedRow>,
        remote: Option<TrackedRow>,
    ) -> Self {
        Self {
            table,
            key,
            conflict_type,
            local,
            remote,
            resolution: Resolution::Unresolved,
            reason: None,
        }
    }

    /// Returns true if the conflict has a resolution other than
    /// [`Resolution::Unresolved`].
    pub fn is_resolved(&self) -> bool {
        self.resolution != Resolution::Unresolved
    }
}

/// Caller-supplied conflict resolution.
///
/// Only invoked for true conflicts.
pub trait ConflictResolver: Send + Sync {
    /// Picks a resolution for `conflict`.
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

/// Resolves `conflict` with `resolver` if given, else with `policy`, and
/// records the outcome on the conflict.
///
/// Apply-time failures are always left unresolved.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidMergeResult`] if a merged row fails the
/// validation an ordinary write would get or changes the key. The conflict
/// is then left [`Resolution::Unresolved`].
pub fn resolve(
    conflict: &mut Conflict,
    table: &Table,
    policy: ConflictPolicy,
    side: Side,
    resolver: Option<&dyn ConflictResolver>,
) -> ProtocolResult<Resolution> {
    let resolution = if conflict.conflict_type.is_failure() {
        Resolution::Unresolved
    } else {
        match resolver {
            Some(resolver) => resolver.resolve(conflict),
            None => policy.resolution_for(side),
        }
    };

    if let Resolution::MergedRow(row) = &resolution {
        let invalid = match row.validate(table).and_then(|()| row.key(table)) {
            Ok(key) if key == conflict.key => None,
            Ok(key) => Some(format!("merged row changes key to {key}")),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = invalid {
            conflict.resolution = Resolution::Unresolved;
            conflict.reason = Some(reason.clone());
            return Err(ProtocolError::InvalidMergeResult {
                table: conflict.table.clone(),
                key: conflict.key.clone(),
                reason,
            });
        }
    }

    conflict.resolution = resolution.clone();
    Ok(resolution)
}

/// What the applying side must do with one incoming row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to write.
    Skip(ConflictType),
    /// Write `row` with `expected_prior` as precondition. `conflict` is set
    /// when the write resolves a true conflict.
    Write {
        /// Row to write.
        row: TrackedRow,
        /// Expected timestamp of the stored row.
        expected_prior: Option<u64>,
        /// The resolved conflict, if any.
        conflict: Option<Conflict>,
    },
    /// The conflict stays for the caller.
    Unresolved(Conflict),
}

/// Classifies and resolves incoming rows for one applying side.
#[derive(Clone)]
pub struct ConflictEngine {
    policy: ConflictPolicy,
    side: Side,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl fmt::Debug for ConflictEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictEngine")
            .field("policy", &self.policy)
            .field("side", &self.side)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl ConflictEngine {
    /// Creates an engine resolving with `policy` on `side`.
    pub fn new(policy: ConflictPolicy, side: Side) -> Self {
        Self {
            policy,
            side,
            resolver: None,
        }
    }

    /// Sets a resolver that takes precedence over the policy.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Returns the applying side.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Decides how to apply `remote`, sent by participant `remote_id`, over
    /// the stored `local` row.
    ///
    /// Rows written on behalf of the remote participant keep `remote_id` as
    /// their origin; merged and re-stamped local rows get no origin so that
    /// they travel back.
    pub fn decide(
        &self,
        table: &Table,
        key: &RowKey,
        local: Option<&TrackedRow>,
        remote: &TrackedRow,
        checkpoints: Checkpoints,
        remote_id: Uuid,
    ) -> Decision {
        let conflict_type = classify(local, Some(remote));
        let incoming = || {
            let mut row = remote.clone();
            row.metadata.update_scope_id = Some(remote_id);
            row
        };

        let local = match (conflict_type, local) {
            (ConflictType::RemoteExistsLocalNotExists, _) => {
                return Decision::Write {
                    row: incoming(),
                    expected_prior: None,
                    conflict: None,
                }
            }
            (t, Some(local)) if t.is_two_sided() => local,
            (t, _) => return Decision::Skip(t),
        };

        let expected_prior = Some(local.metadata.update_timestamp);
        if !checkpoints.both_changed(local, remote, remote_id) {
            return Decision::Write {
                row: incoming(),
                expected_prior,
                conflict: None,
            };
        }

        let mut conflict = Conflict::new(
            table.name.clone(),
            key.clone(),
            conflict_type,
            Some(local.clone()),
            Some(remote.clone()),
        );
        let row = match resolve(
            &mut conflict,
            table,
            self.policy,
            self.side,
            self.resolver.as_deref(),
        ) {
            Ok(Resolution::RemoteWins) => incoming(),
            Ok(Resolution::LocalWins) => {
                let mut row = local.clone();
                row.metadata.update_scope_id = None;
                row
            }
            Ok(Resolution::MergedRow(merged)) => {
                TrackedRow::live(merged, remote.metadata.update_timestamp, None)
            }
            Ok(Resolution::Unresolved) | Err(_) => return Decision::Unresolved(conflict),
        };

        Decision::Write {
            row,
            expected_prior,
            conflict: Some(conflict),
        }
    }
}
