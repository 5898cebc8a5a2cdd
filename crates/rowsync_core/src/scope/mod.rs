//! Scopes: named synchronization identities and their persistence.
//!
//! A scope holds a participant's checkpoint and the schema snapshot taken at
//! provisioning time. The [`ScopeStore`] persists scopes with optimistic
//! concurrency: every save must present the revision it read, so a session
//! that read a scope, did long-running work and writes it back fails with
//! [`CoreError::ConcurrencyConflict`] if anyone else wrote in between.
//!
//! ## Roles
//!
//! - [`ScopeRole::Client`]: one per client database
//! - [`ScopeRole::Server`]: the authoritative definition of what is synchronized
//! - [`ScopeRole::ServerHistory`]: the append-only log of sync attempts,
//!   stored as [`HistoryEntry`] records rather than as a [`Scope`]

mod file;
mod memory;

pub use file::FileScopeStore;
pub use memory::MemoryScopeStore;

use crate::error::{CoreError, CoreResult};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// The role a scope plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeRole {
    /// Client-side scope.
    Client,
    /// Server-side scope.
    Server,
    /// Server-side history of sync attempts.
    ServerHistory,
}

/// How a session selects changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    /// Exchange delta rows only.
    #[default]
    Normal,
    /// Upload the client's delta, then re-download the full server dataset.
    Reinitialize,
    /// Upload every client row, then re-download the full server dataset.
    ReinitializeWithUpload,
}

impl SyncType {
    /// Returns true if the full server dataset is downloaded.
    pub fn is_reinitialize(&self) -> bool {
        !matches!(self, SyncType::Normal)
    }
}

/// A session's claim on a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaim {
    /// The claiming session.
    pub session_id: Uuid,
    /// When the claim was taken.
    pub claimed_at: SystemTime,
}

impl SessionClaim {
    /// Creates a claim taken now.
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            claimed_at: SystemTime::now(),
        }
    }

    /// Returns true if the claim is older than `lease`.
    pub fn is_expired(&self, lease: Duration) -> bool {
        self.claimed_at
            .elapsed()
            .map(|age| age > lease)
            .unwrap_or(false)
    }
}

/// A named synchronization identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Scope name.
    pub name: String,
    /// Scope role.
    pub role: ScopeRole,
    /// Participant owning this scope.
    pub owner_id: Uuid,
    /// Owner's logical clock at the last completed session.
    pub last_sync_timestamp: Option<u64>,
    /// Server clock checkpoint received at the last completed session
    /// (client scopes only).
    pub last_server_sync_timestamp: Option<u64>,
    /// Wall-clock time of the last completed session. Informational only.
    pub last_sync: Option<SystemTime>,
    /// Schema snapshot taken at provisioning time.
    pub schema: Option<Schema>,
    /// True until the first session completes.
    pub is_new: bool,
    /// Set once a reinitializing session starts clearing local tables;
    /// cleared when a session completes. Forces the next session to
    /// reinitialize.
    #[serde(default)]
    pub reinitialize_pending: bool,
    /// Session currently owning the scope.
    pub session: Option<SessionClaim>,
    /// Document revision used for optimistic concurrency.
    pub revision: u64,
}

impl Scope {
    /// Creates a new, never-synchronized scope.
    pub fn new(name: impl Into<String>, role: ScopeRole, owner_id: Uuid) -> Self {
        Self {
            name: name.into(),
            role,
            owner_id,
            last_sync_timestamp: None,
            last_server_sync_timestamp: None,
            last_sync: None,
            schema: None,
            is_new: true,
            reinitialize_pending: false,
            session: None,
            revision: 0,
        }
    }

    /// Returns true if a session other than `session_id` holds a live claim.
    pub fn is_claimed_by_other(&self, session_id: Uuid, lease: Duration) -> bool {
        matches!(
            self.session,
            Some(claim) if claim.session_id != session_id && !claim.is_expired(lease)
        )
    }
}

/// How a sync attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// All stages completed.
    Succeeded,
    /// A stage failed.
    Failed {
        /// Error description.
        reason: String,
    },
    /// The session was cancelled.
    Cancelled,
}

/// One record of the server history scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Scope name.
    pub scope_name: String,
    /// Client that ran the session.
    pub client_id: Uuid,
    /// Session id.
    pub session_id: Uuid,
    /// Effective sync type.
    pub sync_type: SyncType,
    /// Session start.
    pub started_at: SystemTime,
    /// Session end.
    pub finished_at: SystemTime,
    /// Outcome.
    pub outcome: SessionOutcome,
    /// Server clock checkpoint the client now holds (successful sessions).
    pub server_checkpoint: Option<u64>,
    /// Rows applied on the server.
    pub rows_uploaded: u64,
    /// Rows sent to the client.
    pub rows_downloaded: u64,
    /// Rows that failed or stayed unresolved.
    pub rows_failed: u64,
}

impl HistoryEntry {
    /// Returns true if the session succeeded.
    pub fn succeeded(&self) -> bool {
        self.outcome == SessionOutcome::Succeeded
    }
}

/// Durable storage for scopes.
///
/// Implementations must be `Send + Sync`; the orchestrator shares one store
/// between concurrent sessions of different scopes.
pub trait ScopeStore: Send + Sync {
    /// Loads a scope.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ScopeNotFound`] if no such scope is stored.
    fn get_scope(&self, name: &str, role: ScopeRole) -> CoreResult<Scope>;

    /// Persists a scope and returns it with its new revision.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConcurrencyConflict`] if the stored revision
    /// differs from `scope.revision` (a revision of 0 means "must not exist").
    fn save_scope(&self, scope: &Scope) -> CoreResult<Scope>;

    /// Removes a scope. Removing a missing scope is not an error.
    fn delete_scope(&self, name: &str, role: ScopeRole) -> CoreResult<()>;

    /// Lists every stored scope.
    fn list_scopes(&self) -> CoreResult<Vec<Scope>>;

    /// Returns the store's current logical clock value.
    fn local_timestamp(&self) -> CoreResult<u64>;

    /// Appends a record to the server history.
    fn append_history(&self, entry: HistoryEntry) -> CoreResult<()>;

    /// Returns the history of a scope in append order.
    fn history(&self, name: &str) -> CoreResult<Vec<HistoryEntry>>;

    /// Loads a scope, returning `None` if it does not exist.
    fn find_scope(&self, name: &str, role: ScopeRole) -> CoreResult<Option<Scope>> {
        match self.get_scope(name, role) {
            Ok(scope) => Ok(Some(scope)),
            Err(CoreError::ScopeNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the oldest checkpoint any known client still depends on:
    /// the latest successful checkpoint of each client, minimized across
    /// clients. `None` if no client ever completed a session.
    fn min_client_checkpoint(&self, name: &str) -> CoreResult<Option<u64>> {
        let mut latest: HashMap<Uuid, u64> = HashMap::new();
        for entry in self.history(name)? {
            if let (true, Some(checkpoint)) = (entry.succeeded(), entry.server_checkpoint) {
                latest.insert(entry.client_id, checkpoint);
            }
        }
        Ok(latest.values().min().copied())
    }
}

/// Checks the optimistic-concurrency precondition shared by store
/// implementations.
pub(crate) fn check_revision(stored: Option<&Scope>, incoming: &Scope) -> CoreResult<()> {
    let actual = stored.map_or(0, |s| s.revision);
    let exists = stored.is_some();
    if actual != incoming.revision || (incoming.revision == 0 && exists) {
        return Err(CoreError::ConcurrencyConflict {
            name: incoming.name.clone(),
            expected: incoming.revision,
            actual,
        });
    }
    Ok(())
}
