//! Open sessions, keyed by session id.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use rowsync_batch::BatchInfo;
use rowsync_core::SyncType;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Server-side state of one open session.
#[derive(Debug, Clone)]
pub(crate) struct ServerSession {
    pub session_id: Uuid,
    pub client_id: Uuid,
    pub scope_name: String,
    pub started_at: SystemTime,
    pub opened: Instant,
    /// Client clock at its last completed session.
    pub last_client_checkpoint: Option<u64>,
    /// Server clock the client received at its last completed session.
    pub last_server_checkpoint: Option<u64>,
    pub sync_type: SyncType,
    /// Server clock captured before the download was selected.
    pub server_timestamp: Option<u64>,
    pub download: Option<BatchInfo>,
    pub rows_uploaded: u64,
    pub rows_failed: u64,
    pub cancel: CancellationToken,
}

impl ServerSession {
    pub fn new(
        session_id: Uuid,
        client_id: Uuid,
        scope_name: impl Into<String>,
        last_client_checkpoint: Option<u64>,
        last_server_checkpoint: Option<u64>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            scope_name: scope_name.into(),
            started_at: SystemTime::now(),
            opened: Instant::now(),
            last_client_checkpoint,
            last_server_checkpoint,
            sync_type: SyncType::Normal,
            server_timestamp: None,
            download: None,
            rows_uploaded: 0,
            rows_failed: 0,
            cancel: CancellationToken::new(),
        }
    }

    fn is_expired(&self, lease: Duration) -> bool {
        self.opened.elapsed() > lease
    }
}

/// The table of open sessions.
///
/// A client holds at most one live session per scope. Sessions older than
/// the lease are considered abandoned and are replaced.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: RwLock<HashMap<Uuid, ServerSession>>,
}

impl SessionTable {
    /// Registers `session`.
    ///
    /// Re-opening the same session id is accepted so that begin requests
    /// can be retried. Returns the sessions that were evicted because their
    /// lease ran out.
    pub fn open(&self, session: ServerSession, lease: Duration) -> ServerResult<Vec<ServerSession>> {
        let mut sessions = self.sessions.write();

        if sessions.contains_key(&session.session_id) {
            return Ok(Vec::new());
        }

        let mut evicted = Vec::new();
        let holders: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.client_id == session.client_id && s.scope_name == session.scope_name)
            .map(|s| s.session_id)
            .collect();
        for id in holders {
            let Some(existing) = sessions.get(&id) else {
                continue;
            };
            if !existing.is_expired(lease) {
                return Err(ServerError::SessionAlreadyInProgress {
                    scope: session.scope_name.clone(),
                    client_id: session.client_id,
                });
            }
            warn!(
                session_id = %id,
                client_id = %session.client_id,
                scope = %session.scope_name,
                "replacing expired session"
            );
            if let Some(stale) = sessions.remove(&id) {
                stale.cancel.cancel();
                evicted.push(stale);
            }
        }

        sessions.insert(session.session_id, session);
        Ok(evicted)
    }

    /// Returns a snapshot of a session.
    pub fn get(&self, session_id: Uuid) -> ServerResult<ServerSession> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(ServerError::UnknownSession(session_id))
    }

    /// Mutates an open session in place.
    pub fn update<R>(
        &self,
        session_id: Uuid,
        f: impl FnOnce(&mut ServerSession) -> R,
    ) -> ServerResult<R> {
        self.sessions
            .write()
            .get_mut(&session_id)
            .map(f)
            .ok_or(ServerError::UnknownSession(session_id))
    }

    /// Removes a session.
    pub fn close(&self, session_id: Uuid) -> ServerResult<ServerSession> {
        self.sessions
            .write()
            .remove(&session_id)
            .ok_or(ServerError::UnknownSession(session_id))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
