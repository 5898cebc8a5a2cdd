//! Request handlers for session calls.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::sessions::{ServerSession, SessionTable};
use parking_lot::Mutex;
use rowsync_batch::BatchEngine;
use rowsync_core::{
    ChangeTrackingAdapter, HistoryEntry, Schema, Scope, ScopeRole, ScopeStore, SessionOutcome,
};
use rowsync_engine::{
    apply_batch, retry, select_into_batch, ApplyContext, Direction, Selection, SyncError,
};
use rowsync_protocol::{
    AbortSessionRequest, BeginSessionRequest, BeginSessionResponse, Checkpoints,
    CleanMetadataRequest, CleanMetadataResponse, ConflictEngine, ConflictResolver,
    DownloadRequest, DownloadResponse, EndSessionRequest, Side, UploadRequest, UploadResponse,
    PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Shared state of the request handlers.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The server's tracked data store.
    pub adapter: Arc<dyn ChangeTrackingAdapter>,
    /// Server and history scopes.
    pub scopes: Arc<dyn ScopeStore>,
    pub(crate) batches: BatchEngine,
    pub(crate) sessions: SessionTable,
    conflicts: ConflictEngine,
    /// Serializes read-modify-write of server scopes.
    scope_lock: Mutex<()>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(
        config: ServerConfig,
        adapter: Arc<dyn ChangeTrackingAdapter>,
        scopes: Arc<dyn ScopeStore>,
        resolver: Option<Arc<dyn ConflictResolver>>,
    ) -> Self {
        let batches = BatchEngine::new(config.batch_config());
        let conflicts = ConflictEngine::new(config.conflict_policy, Side::Server);
        let conflicts = match resolver {
            Some(resolver) => conflicts.with_resolver(resolver),
            None => conflicts,
        };
        Self {
            config,
            adapter,
            scopes,
            batches,
            sessions: SessionTable::default(),
            conflicts,
            scope_lock: Mutex::new(()),
        }
    }

    /// Returns the schema of a registered server scope.
    pub(crate) fn server_schema(&self, name: &str) -> ServerResult<Schema> {
        self.scopes
            .find_scope(name, ScopeRole::Server)?
            .and_then(|scope| scope.schema)
            .ok_or_else(|| ServerError::UnknownScope(name.to_string()))
    }

    /// Applies `f` to the stored server scope and saves it.
    pub(crate) fn update_server_scope(
        &self,
        name: &str,
        f: impl FnOnce(&mut Scope),
    ) -> ServerResult<Scope> {
        let _guard = self.scope_lock.lock();
        let mut scope = self
            .scopes
            .find_scope(name, ScopeRole::Server)?
            .unwrap_or_else(|| Scope::new(name, ScopeRole::Server, self.config.server_id));
        f(&mut scope);
        Ok(self.scopes.save_scope(&scope)?)
    }

    fn dispose_download(&self, session: &ServerSession) {
        if let Some(batch) = &session.download {
            if let Err(e) = self.batches.dispose(batch) {
                warn!(session_id = %session.session_id, batch = %batch.directory_name, error = %e, "failed to dispose download batch");
            }
        }
    }
}

/// Handler for session calls.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Opens a session and returns the server schema and clock.
    pub async fn handle_begin_session(
        &self,
        request: &BeginSessionRequest,
    ) -> ServerResult<BeginSessionResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: request.protocol_version,
            });
        }
        let ctx = &self.context;
        let schema = ctx.server_schema(&request.scope_name)?;

        let session = ServerSession::new(
            request.session_id,
            request.client_id,
            &request.scope_name,
            request.last_client_checkpoint,
            request.last_server_checkpoint,
        );
        let cancel = session.cancel.clone();
        for stale in ctx.sessions.open(session, ctx.config.session_lease)? {
            ctx.dispose_download(&stale);
            record(
                ctx,
                &stale,
                SessionOutcome::Failed {
                    reason: "session lease expired".into(),
                },
                None,
                0,
            );
        }

        let adapter = &*ctx.adapter;
        let server_timestamp = retry(&ctx.config.retry, &cancel, "local_timestamp", || async move {
            adapter.local_timestamp().await.map_err(SyncError::from)
        })
        .await?;

        info!(
            session_id = %request.session_id,
            client_id = %request.client_id,
            scope = %request.scope_name,
            server_timestamp,
            "session opened"
        );
        Ok(BeginSessionResponse {
            server_id: ctx.config.server_id,
            schema,
            server_timestamp,
        })
    }

    /// Applies a client's uploaded batch.
    pub async fn handle_upload(&self, request: &UploadRequest) -> ServerResult<UploadResponse> {
        let ctx = &self.context;
        let session = ctx.sessions.get(request.session_id)?;
        let schema = ctx.server_schema(&session.scope_name)?;

        let apply = ApplyContext {
            adapter: &*ctx.adapter,
            schema: &schema,
            conflicts: &ctx.conflicts,
            checkpoints: Checkpoints::new(
                session.last_server_checkpoint,
                session.last_client_checkpoint,
            ),
            remote_id: session.client_id,
            direction: Direction::Upload,
            degree_of_parallelism: ctx.config.degree_of_parallelism,
            cycle_policy: ctx.config.cycle_policy,
            retry: &ctx.config.retry,
            cancel: &session.cancel,
        };
        let report = apply_batch(&apply, &request.batch).await?;

        let total = report.stats.total();
        ctx.sessions.update(request.session_id, |s| {
            s.rows_uploaded = total.written();
            s.rows_failed = total.not_applied();
        })?;
        debug!(
            session_id = %request.session_id,
            applied = total.written(),
            failed = report.failures.len(),
            unresolved = report.conflicts.len(),
            "upload applied"
        );
        Ok(UploadResponse {
            stats: report.stats,
            failures: report.failures,
            conflicts: report.conflicts,
        })
    }

    /// Selects the changes a client has not seen.
    ///
    /// The server clock is captured before selecting, so rows written while
    /// the selection runs are picked up by the next session.
    pub async fn handle_download(
        &self,
        request: &DownloadRequest,
    ) -> ServerResult<DownloadResponse> {
        let ctx = &self.context;
        let session = ctx.sessions.get(request.session_id)?;
        let schema = ctx.server_schema(&session.scope_name)?;

        let adapter = &*ctx.adapter;
        let server_timestamp = retry(&ctx.config.retry, &session.cancel, "local_timestamp", || async move {
            adapter.local_timestamp().await.map_err(SyncError::from)
        })
        .await?;

        let selection = if request.sync_type.is_reinitialize() {
            Selection::full(Direction::Download)
        } else {
            Selection::delta(
                Direction::Download,
                session.last_server_checkpoint,
                Some(session.client_id),
            )
        };
        let batch = select_into_batch(
            adapter,
            &ctx.batches,
            &schema,
            &selection,
            &ctx.config.retry,
            &session.cancel,
        )
        .await?;

        // A retried download replaces the previous batch.
        ctx.dispose_download(&session);
        let stored = batch.clone();
        ctx.sessions.update(request.session_id, move |s| {
            s.sync_type = request.sync_type;
            s.server_timestamp = Some(server_timestamp);
            s.download = Some(stored);
        })?;
        debug!(
            session_id = %request.session_id,
            sync_type = ?request.sync_type,
            rows = batch.row_count(),
            parts = batch.parts.len(),
            server_timestamp,
            "download selected"
        );
        Ok(DownloadResponse {
            batch,
            server_timestamp,
        })
    }

    /// Purges tombstones every known client has already received.
    pub async fn handle_clean_metadata(
        &self,
        request: &CleanMetadataRequest,
    ) -> ServerResult<CleanMetadataResponse> {
        let ctx = &self.context;
        let session = ctx.sessions.get(request.session_id)?;
        if !ctx.config.clean_metadata {
            return Ok(CleanMetadataResponse::default());
        }
        let schema = ctx.server_schema(&session.scope_name)?;

        // The session's own client is not in the history until it ends.
        let known = ctx.scopes.min_client_checkpoint(&session.scope_name)?;
        let min_checkpoint = match (known, session.last_server_checkpoint) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(older_than) = min_checkpoint else {
            return Ok(CleanMetadataResponse::default());
        };

        let adapter = &*ctx.adapter;
        let mut purged = 0;
        for table in schema.tables() {
            let name = &table.name;
            purged += retry(&ctx.config.retry, &session.cancel, "purge_tombstones", || async move {
                adapter
                    .purge_tombstones(name, older_than)
                    .await
                    .map_err(SyncError::from)
            })
            .await?;
        }
        debug!(session_id = %request.session_id, purged, older_than, "server tombstones purged");
        Ok(CleanMetadataResponse {
            purged,
            min_checkpoint,
        })
    }

    /// Completes a session: records history and advances the server scope.
    pub async fn handle_end_session(&self, request: &EndSessionRequest) -> ServerResult<()> {
        let ctx = &self.context;
        let session = ctx.sessions.close(request.session_id)?;
        ctx.dispose_download(&session);

        let mut finished = session.clone();
        finished.sync_type = request.sync_type;
        finished.rows_failed += request.rows_failed;
        record(
            ctx,
            &finished,
            SessionOutcome::Succeeded,
            Some(request.server_checkpoint),
            request.rows_downloaded,
        );

        let server_timestamp = session.server_timestamp.unwrap_or(request.server_checkpoint);
        ctx.update_server_scope(&session.scope_name, |scope| {
            scope.last_sync_timestamp = Some(
                scope
                    .last_sync_timestamp
                    .map_or(server_timestamp, |t| t.max(server_timestamp)),
            );
            scope.last_sync = Some(SystemTime::now());
            scope.is_new = false;
        })?;

        info!(
            session_id = %request.session_id,
            client_id = %session.client_id,
            scope = %session.scope_name,
            server_checkpoint = request.server_checkpoint,
            uploaded = session.rows_uploaded,
            downloaded = request.rows_downloaded,
            "session ended"
        );
        Ok(())
    }

    /// Abandons a session. Aborting an unknown session succeeds.
    pub async fn handle_abort_session(&self, request: &AbortSessionRequest) -> ServerResult<()> {
        let ctx = &self.context;
        let session = match ctx.sessions.close(request.session_id) {
            Ok(session) => session,
            Err(ServerError::UnknownSession(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        session.cancel.cancel();
        ctx.dispose_download(&session);

        let outcome = if request.cancelled {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Failed {
                reason: request.reason.clone(),
            }
        };
        record(ctx, &session, outcome, None, 0);
        warn!(
            session_id = %request.session_id,
            client_id = %session.client_id,
            scope = %session.scope_name,
            reason = %request.reason,
            cancelled = request.cancelled,
            "session aborted"
        );
        Ok(())
    }
}

/// Appends a history entry. A failed append is logged, not returned.
fn record(
    ctx: &HandlerContext,
    session: &ServerSession,
    outcome: SessionOutcome,
    server_checkpoint: Option<u64>,
    rows_downloaded: u64,
) {
    let entry = HistoryEntry {
        scope_name: session.scope_name.clone(),
        client_id: session.client_id,
        session_id: session.session_id,
        sync_type: session.sync_type,
        started_at: session.started_at,
        finished_at: SystemTime::now(),
        outcome,
        server_checkpoint,
        rows_uploaded: session.rows_uploaded,
        rows_downloaded,
        rows_failed: session.rows_failed,
    };
    if let Err(e) = ctx.scopes.append_history(entry) {
        warn!(session_id = %session.session_id, error = %e, "failed to append history");
    }
}
