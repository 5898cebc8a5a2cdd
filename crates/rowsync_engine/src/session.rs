//! Session orchestration on the client side.
//!
//! A session walks a fixed sequence of stages:
//!
//! ```text
//! None → BeginSession → ScopeLoading → SchemaReading → Provisioning
//!      → ChangesSelecting → ChangesApplying(Upload) → ChangesApplying(Download)
//!      → MetadataCleaning → EndSession
//! ```
//!
//! Any non-terminal stage may move to `Error`. Checkpoints are persisted
//! only at `EndSession`; a failed session releases its claim on the scope
//! and leaves the checkpoints where they were.

use crate::changes::{apply_batch, select_into_batch, ApplyContext, ApplyReport, Direction, Selection};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::provisioning::Provisioner;
use crate::retry::{retry, with_timeout};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use rowsync_batch::{BatchEngine, BatchInfo};
use rowsync_core::{
    ChangeTrackingAdapter, CoreError, ProvisioningManager, Schema, Scope, ScopeRole, ScopeStore,
    SessionClaim, SyncType,
};
use rowsync_protocol::{
    AbortSessionRequest, ApplyStats, BeginSessionRequest, Checkpoints, CleanMetadataRequest,
    Conflict, ConflictEngine, ConflictResolver, DownloadRequest, EndSessionRequest, RowFailure,
    Side, UploadRequest,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stage of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStage {
    /// No session has started.
    None,
    /// The session was created.
    BeginSession,
    /// Client scope loaded and claimed, server session opened.
    ScopeLoading,
    /// Cached schema compared against the server schema.
    SchemaReading,
    /// Tracking infrastructure reconciled.
    Provisioning,
    /// Local changes selected into a batch.
    ChangesSelecting,
    /// A batch is being applied.
    ChangesApplying(Direction),
    /// Tombstones purged.
    MetadataCleaning,
    /// The session completed.
    EndSession,
    /// The session failed.
    Error,
}

impl SessionStage {
    fn position(self) -> u8 {
        match self {
            SessionStage::None => 0,
            SessionStage::BeginSession => 1,
            SessionStage::ScopeLoading => 2,
            SessionStage::SchemaReading => 3,
            SessionStage::Provisioning => 4,
            SessionStage::ChangesSelecting => 5,
            SessionStage::ChangesApplying(Direction::Upload) => 6,
            SessionStage::ChangesApplying(Direction::Download) => 7,
            SessionStage::MetadataCleaning => 8,
            SessionStage::EndSession => 9,
            SessionStage::Error => u8::MAX,
        }
    }

    /// Returns true for `EndSession` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStage::EndSession | SessionStage::Error)
    }

    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionStage::None) && !self.is_terminal()
    }

    /// Returns true if `next` directly follows this stage.
    pub fn can_transition_to(&self, next: SessionStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == SessionStage::Error || next.position() == self.position() + 1
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State threaded through every stage of one session.
#[derive(Debug)]
pub struct SessionContext {
    /// Session id.
    pub session_id: Uuid,
    /// Scope being synchronized.
    pub scope_name: String,
    /// Sync type after upgrades (new scope, checkpoint ahead of server).
    pub sync_type: SyncType,
    /// Local clock captured at `ChangesSelecting`; the next client checkpoint.
    pub client_checkpoint: Option<u64>,
    /// Server clock captured at download; the next server checkpoint.
    pub server_checkpoint: Option<u64>,
    /// Cancellation token.
    pub cancel: CancellationToken,
    /// Current stage.
    pub stage: SessionStage,
    started: Instant,
    scope: Option<Scope>,
    server_open: bool,
    batches: Vec<BatchInfo>,
}

impl SessionContext {
    /// Creates a context for a new session.
    pub fn new(scope_name: impl Into<String>, sync_type: SyncType, cancel: CancellationToken) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope_name: scope_name.into(),
            sync_type,
            client_checkpoint: None,
            server_checkpoint: None,
            cancel,
            stage: SessionStage::None,
            started: Instant::now(),
            scope: None,
            server_open: false,
            batches: Vec::new(),
        }
    }

    /// Moves to `next`, checking cancellation at the boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the session was cancelled and
    /// [`SyncError::InvalidStateTransition`] if `next` does not follow the
    /// current stage.
    pub fn advance(&mut self, next: SessionStage) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.stage.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        debug!(session_id = %self.session_id, scope = %self.scope_name, stage = %next, "stage");
        self.stage = next;
        Ok(())
    }

    fn scope(&self) -> SyncResult<&Scope> {
        self.scope.as_ref().ok_or_else(|| SyncError::InvalidStateTransition {
            from: self.stage.to_string(),
            to: "scope access before ScopeLoading".into(),
        })
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Session id.
    pub session_id: Uuid,
    /// Effective sync type.
    pub sync_type: SyncType,
    /// Counts of rows applied on the server.
    pub upload: ApplyStats,
    /// Counts of rows applied locally.
    pub download: ApplyStats,
    /// Rows that could not be applied, on either side.
    pub failures: Vec<RowFailure>,
    /// True conflicts left unresolved, on either side.
    pub conflicts: Vec<Conflict>,
    /// New client checkpoint.
    pub client_checkpoint: Option<u64>,
    /// New server checkpoint.
    pub server_checkpoint: Option<u64>,
    /// Tombstones purged locally and on the server.
    pub purged_tombstones: u64,
    /// Time the session took.
    pub duration: Duration,
}

impl SessionResult {
    /// Returns true if every row was applied.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.conflicts.is_empty()
    }

    /// Rows written on the server.
    pub fn rows_uploaded(&self) -> u64 {
        self.upload.total().written()
    }

    /// Rows written locally.
    pub fn rows_downloaded(&self) -> u64 {
        self.download.total().written()
    }
}

/// Cumulative statistics of an agent.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions started.
    pub sessions_started: u64,
    /// Sessions that completed.
    pub sessions_completed: u64,
    /// Sessions that failed or were cancelled.
    pub sessions_failed: u64,
    /// Rows written on the server.
    pub rows_uploaded: u64,
    /// Rows written locally.
    pub rows_downloaded: u64,
    /// True conflicts resolved.
    pub conflicts_resolved: u64,
    /// True conflicts left unresolved.
    pub conflicts_unresolved: u64,
    /// Rows that could not be applied.
    pub rows_failed: u64,
    /// Time of the last completed session.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// The client-side orchestrator.
///
/// One agent drives sessions for one scope of one client store. Sessions of
/// the same scope are mutually exclusive through the scope claim, so
/// concurrent calls to [`SyncAgent::synchronize`] fail fast with
/// [`SyncError::SessionAlreadyInProgress`].
pub struct SyncAgent {
    config: SyncConfig,
    adapter: Arc<dyn ChangeTrackingAdapter>,
    provisioner: Provisioner,
    scopes: Arc<dyn ScopeStore>,
    transport: Arc<dyn SyncTransport>,
    batches: BatchEngine,
    resolver: Option<Arc<dyn ConflictResolver>>,
    stage: RwLock<SessionStage>,
    stats: RwLock<SyncStats>,
}

impl fmt::Debug for SyncAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncAgent")
            .field("config", &self.config)
            .field("stage", &*self.stage.read())
            .finish_non_exhaustive()
    }
}

impl SyncAgent {
    /// Creates an agent.
    pub fn new(
        config: SyncConfig,
        adapter: Arc<dyn ChangeTrackingAdapter>,
        provisioning: Arc<dyn ProvisioningManager>,
        scopes: Arc<dyn ScopeStore>,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let batches = BatchEngine::new(config.batch_config());
        let provisioner = Provisioner::new(provisioning, config.retry.clone());
        Self {
            config,
            adapter,
            provisioner,
            scopes,
            transport,
            batches,
            resolver: None,
            stage: RwLock::new(SessionStage::None),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Sets a conflict resolver that takes precedence over the policy.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the stage of the current or last session.
    pub fn stage(&self) -> SessionStage {
        *self.stage.read()
    }

    /// Returns the cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Runs one session.
    pub async fn synchronize(&self, sync_type: SyncType) -> SyncResult<SessionResult> {
        self.synchronize_with_cancel(sync_type, CancellationToken::new())
            .await
    }

    /// Runs one session that stops at the next stage boundary or batch part
    /// once `cancel` fires.
    pub async fn synchronize_with_cancel(
        &self,
        sync_type: SyncType,
        cancel: CancellationToken,
    ) -> SyncResult<SessionResult> {
        let mut ctx = SessionContext::new(&self.config.scope_name, sync_type, cancel);
        self.stats.write().sessions_started += 1;
        info!(session_id = %ctx.session_id, scope = %ctx.scope_name, ?sync_type, "session starting");

        let outcome = self.run(&mut ctx).await;
        self.dispose_batches(&mut ctx);

        match outcome {
            Ok(result) => {
                info!(
                    session_id = %ctx.session_id,
                    scope = %ctx.scope_name,
                    sync_type = ?result.sync_type,
                    uploaded = result.rows_uploaded(),
                    downloaded = result.rows_downloaded(),
                    failed = result.failures.len(),
                    unresolved = result.conflicts.len(),
                    "session completed"
                );
                self.record_success(&result);
                Ok(result)
            }
            Err(e) => {
                self.fail(&mut ctx, &e).await;
                Err(e)
            }
        }
    }

    /// Drops the tracking infrastructure of the scope's schema and deletes
    /// the client scope.
    pub async fn deprovision(&self) -> SyncResult<()> {
        let cancel = CancellationToken::new();
        if let Some(scope) = self
            .scopes
            .find_scope(&self.config.scope_name, ScopeRole::Client)?
        {
            if let Some(schema) = &scope.schema {
                self.provisioner.deprovision(schema, &cancel).await?;
            }
            self.scopes
                .delete_scope(&self.config.scope_name, ScopeRole::Client)?;
        }
        Ok(())
    }

    fn set_stage(&self, ctx: &mut SessionContext, next: SessionStage) -> SyncResult<()> {
        ctx.advance(next)?;
        *self.stage.write() = next;
        Ok(())
    }

    async fn run(&self, ctx: &mut SessionContext) -> SyncResult<SessionResult> {
        self.set_stage(ctx, SessionStage::BeginSession)?;

        // Scope loading: claim the client scope, then open the server side.
        self.set_stage(ctx, SessionStage::ScopeLoading)?;
        let scope = self.claim_scope(ctx)?;
        let begin = BeginSessionRequest::new(ctx.session_id, self.config.client_id, &ctx.scope_name)
            .with_checkpoints(scope.last_sync_timestamp, scope.last_server_sync_timestamp);
        let transport = &*self.transport;
        let begin = &begin;
        let server = self
            .call(ctx, "begin_session", move || transport.begin_session(begin))
            .await?;
        ctx.server_open = true;
        let requested = ctx.sync_type;
        ctx.sync_type = effective_sync_type(requested, &scope, server.server_timestamp);
        if ctx.sync_type != requested {
            info!(session_id = %ctx.session_id, ?requested, sync_type = ?ctx.sync_type, "sync type upgraded");
        }

        // Schema reading: dependency order is validated up front so that a
        // cycle fails before anything is written.
        self.set_stage(ctx, SessionStage::SchemaReading)?;
        server.schema.dependency_order(self.config.cycle_policy)?;
        let needs_provisioning = match &scope.schema {
            None => true,
            Some(cached) => !cached.diff(&server.schema)?.is_empty(),
        };

        self.set_stage(ctx, SessionStage::Provisioning)?;
        if needs_provisioning {
            let outcome = self
                .provisioner
                .reconcile(scope.schema.as_ref(), &server.schema, &ctx.cancel)
                .await?;
            debug!(session_id = %ctx.session_id, steps = outcome.steps.len(), "provisioning done");
            let mut updated = ctx.scope()?.clone();
            updated.schema = Some(server.schema.clone());
            ctx.scope = Some(self.scopes.save_scope(&updated)?);
        }
        let schema = &server.schema;

        // Changes selecting: the captured clock becomes the next checkpoint.
        self.set_stage(ctx, SessionStage::ChangesSelecting)?;
        let adapter = &*self.adapter;
        let checkpoint = retry(&self.config.retry, &ctx.cancel, "local_timestamp", || async move {
            adapter.local_timestamp().await.map_err(SyncError::from)
        })
        .await?;
        ctx.client_checkpoint = Some(checkpoint);
        let selection = match ctx.sync_type {
            SyncType::ReinitializeWithUpload => Selection::full(Direction::Upload),
            SyncType::Normal | SyncType::Reinitialize => Selection::delta(
                Direction::Upload,
                scope.last_sync_timestamp,
                Some(server.server_id),
            ),
        };
        let upload_batch = select_into_batch(
            adapter,
            &self.batches,
            schema,
            &selection,
            &self.config.retry,
            &ctx.cancel,
        )
        .await?;
        ctx.batches.push(upload_batch.clone());
        info!(session_id = %ctx.session_id, rows = upload_batch.row_count(), parts = upload_batch.parts.len(), "changes selected");

        // Upload.
        self.set_stage(ctx, SessionStage::ChangesApplying(Direction::Upload))?;
        let upload = UploadRequest {
            session_id: ctx.session_id,
            batch: upload_batch,
        };
        let upload = &upload;
        let uploaded = self
            .call(ctx, "upload", move || transport.upload(upload))
            .await?;
        info!(
            session_id = %ctx.session_id,
            applied = uploaded.stats.total().written(),
            failed = uploaded.failures.len(),
            unresolved = uploaded.conflicts.len(),
            "upload applied"
        );

        // Download.
        self.set_stage(ctx, SessionStage::ChangesApplying(Direction::Download))?;
        let download = DownloadRequest {
            session_id: ctx.session_id,
            sync_type: ctx.sync_type,
        };
        let download = &download;
        let downloaded = self
            .call(ctx, "download", move || transport.download(download))
            .await?;
        ctx.batches.push(downloaded.batch.clone());
        ctx.server_checkpoint = Some(downloaded.server_timestamp);

        // Local tables are only cleared once the replacement rows are in
        // hand, and the scope remembers the reset until a session completes.
        if ctx.sync_type.is_reinitialize() && !scope.is_new {
            if uploaded.stats.total().not_applied() == 0 {
                let mut pending = ctx.scope()?.clone();
                pending.reinitialize_pending = true;
                ctx.scope = Some(self.scopes.save_scope(&pending)?);
                self.reset_tables(ctx, schema).await?;
            } else {
                warn!(session_id = %ctx.session_id, "skipping table reset, some local rows were not uploaded");
            }
        }

        let conflicts = ConflictEngine::new(self.config.conflict_policy, Side::Client);
        let conflicts = match &self.resolver {
            Some(resolver) => conflicts.with_resolver(Arc::clone(resolver)),
            None => conflicts,
        };
        let remote_checkpoint = if ctx.sync_type.is_reinitialize() {
            None
        } else {
            scope.last_server_sync_timestamp
        };
        let apply = ApplyContext {
            adapter,
            schema,
            conflicts: &conflicts,
            checkpoints: Checkpoints::new(scope.last_sync_timestamp, remote_checkpoint),
            remote_id: server.server_id,
            direction: Direction::Download,
            degree_of_parallelism: self.config.degree_of_parallelism,
            cycle_policy: self.config.cycle_policy,
            retry: &self.config.retry,
            cancel: &ctx.cancel,
        };
        let applied = apply_batch(&apply, &downloaded.batch).await?;
        info!(
            session_id = %ctx.session_id,
            applied = applied.stats.total().written(),
            failed = applied.failures.len(),
            unresolved = applied.conflicts.len(),
            "download applied"
        );

        // Metadata cleaning.
        self.set_stage(ctx, SessionStage::MetadataCleaning)?;
        let purged = if self.config.clean_metadata {
            self.clean_metadata(ctx, schema, scope.last_sync_timestamp)
                .await?
        } else {
            0
        };

        // End session: the server records history first, then the client
        // checkpoints advance and the claim is released.
        self.set_stage(ctx, SessionStage::EndSession)?;
        let end = EndSessionRequest {
            session_id: ctx.session_id,
            sync_type: ctx.sync_type,
            server_checkpoint: downloaded.server_timestamp,
            rows_downloaded: applied.stats.total().written(),
            rows_failed: applied.stats.total().not_applied(),
        };
        let end = &end;
        self.call(ctx, "end_session", move || transport.end_session(end))
            .await?;
        ctx.server_open = false;

        let mut completed = ctx.scope()?.clone();
        completed.last_sync_timestamp = ctx.client_checkpoint;
        completed.last_server_sync_timestamp = ctx.server_checkpoint;
        completed.last_sync = Some(SystemTime::now());
        completed.is_new = false;
        completed.reinitialize_pending = false;
        completed.session = None;
        ctx.scope = Some(self.scopes.save_scope(&completed)?);

        let ApplyReport {
            stats: download_stats,
            failures: download_failures,
            conflicts: download_conflicts,
        } = applied;
        let mut failures = uploaded.failures.clone();
        failures.extend(download_failures);
        let mut unresolved = uploaded.conflicts.clone();
        unresolved.extend(download_conflicts);

        Ok(SessionResult {
            session_id: ctx.session_id,
            sync_type: ctx.sync_type,
            upload: uploaded.stats.clone(),
            download: download_stats,
            failures,
            conflicts: unresolved,
            client_checkpoint: ctx.client_checkpoint,
            server_checkpoint: ctx.server_checkpoint,
            purged_tombstones: purged,
            duration: ctx.started.elapsed(),
        })
    }

    /// Loads or creates the client scope and claims it for the session.
    fn claim_scope(&self, ctx: &mut SessionContext) -> SyncResult<Scope> {
        let mut scope = self
            .scopes
            .find_scope(&ctx.scope_name, ScopeRole::Client)?
            .unwrap_or_else(|| Scope::new(&ctx.scope_name, ScopeRole::Client, self.config.client_id));

        if scope.is_claimed_by_other(ctx.session_id, self.config.session_lease) {
            return Err(SyncError::SessionAlreadyInProgress {
                scope: ctx.scope_name.clone(),
            });
        }
        if let Some(stale) = scope.session {
            warn!(scope = %ctx.scope_name, stale_session = %stale.session_id, "taking over expired session claim");
        }

        scope.session = Some(SessionClaim::new(ctx.session_id));
        let saved = match self.scopes.save_scope(&scope) {
            Ok(saved) => saved,
            Err(CoreError::ConcurrencyConflict { .. }) => {
                return Err(SyncError::SessionAlreadyInProgress {
                    scope: ctx.scope_name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        ctx.scope = Some(saved.clone());
        Ok(saved)
    }

    async fn reset_tables(&self, ctx: &SessionContext, schema: &Schema) -> SyncResult<()> {
        let mut order = schema.dependency_order(self.config.cycle_policy)?;
        order.reverse();
        let adapter = &*self.adapter;
        for name in &order {
            let downloads = schema
                .table(name)
                .is_some_and(|table| table.direction.downloads());
            if !downloads {
                continue;
            }
            retry(&self.config.retry, &ctx.cancel, "reset_table", || async move {
                adapter.reset_table(name).await.map_err(SyncError::from)
            })
            .await?;
        }
        info!(session_id = %ctx.session_id, tables = order.len(), "tables reset for reinitialization");
        Ok(())
    }

    async fn clean_metadata(
        &self,
        ctx: &SessionContext,
        schema: &Schema,
        previous_checkpoint: Option<u64>,
    ) -> SyncResult<u64> {
        let mut purged = 0;
        if let Some(older_than) = previous_checkpoint {
            let adapter = &*self.adapter;
            for table in schema.tables() {
                let name = &table.name;
                purged += retry(&self.config.retry, &ctx.cancel, "purge_tombstones", || async move {
                    adapter
                        .purge_tombstones(name, older_than)
                        .await
                        .map_err(SyncError::from)
                })
                .await?;
            }
        }

        let request = CleanMetadataRequest {
            session_id: ctx.session_id,
        };
        let request = &request;
        let transport = &*self.transport;
        let server = self
            .call(ctx, "clean_metadata", move || transport.clean_metadata(request))
            .await?;
        debug!(session_id = %ctx.session_id, local = purged, server = server.purged, "tombstones purged");
        Ok(purged + server.purged)
    }

    /// Runs a transport call with the per-call timeout and retries.
    async fn call<T, F, Fut>(&self, ctx: &SessionContext, label: &str, mut call: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let timeout = self.config.timeout;
        retry(&self.config.retry, &ctx.cancel, label, || {
            with_timeout(timeout, call())
        })
        .await
    }

    fn dispose_batches(&self, ctx: &mut SessionContext) {
        for batch in ctx.batches.drain(..) {
            if let Err(e) = self.batches.dispose(&batch) {
                warn!(session_id = %ctx.session_id, batch = %batch.directory_name, error = %e, "failed to dispose batch");
            }
        }
    }

    async fn fail(&self, ctx: &mut SessionContext, error: &SyncError) {
        let cancelled = matches!(error, SyncError::Cancelled);
        warn!(session_id = %ctx.session_id, scope = %ctx.scope_name, stage = %ctx.stage, error = %error, "session failed");
        if ctx.advance(SessionStage::Error).is_err() {
            ctx.stage = SessionStage::Error;
        }
        *self.stage.write() = SessionStage::Error;

        if ctx.scope.is_some() {
            self.release_claim(ctx);
        }

        if ctx.server_open {
            let request = AbortSessionRequest {
                session_id: ctx.session_id,
                reason: error.to_string(),
                cancelled,
            };
            let aborted = with_timeout(self.config.timeout, self.transport.abort_session(&request)).await;
            if let Err(e) = aborted {
                warn!(session_id = %ctx.session_id, error = %e, "failed to abort server session");
            }
            ctx.server_open = false;
        }

        let mut stats = self.stats.write();
        stats.sessions_failed += 1;
        stats.last_error = Some(error.to_string());
    }

    fn release_claim(&self, ctx: &SessionContext) {
        let released = self
            .scopes
            .find_scope(&ctx.scope_name, ScopeRole::Client)
            .map_err(SyncError::from)
            .and_then(|stored| match stored {
                Some(mut scope) if scope.session.map(|c| c.session_id) == Some(ctx.session_id) => {
                    scope.session = None;
                    self.scopes.save_scope(&scope).map(|_| ()).map_err(SyncError::from)
                }
                _ => Ok(()),
            });
        if let Err(e) = released {
            warn!(session_id = %ctx.session_id, error = %e, "failed to release scope claim");
        }
    }

    fn record_success(&self, result: &SessionResult) {
        let upload = result.upload.total();
        let download = result.download.total();
        let mut stats = self.stats.write();
        stats.sessions_completed += 1;
        stats.rows_uploaded += upload.written();
        stats.rows_downloaded += download.written();
        stats.conflicts_resolved += upload.resolved_conflicts + download.resolved_conflicts;
        stats.conflicts_unresolved += upload.unresolved_conflicts + download.unresolved_conflicts;
        stats.rows_failed += upload.failed + download.failed;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
    }
}

/// Upgrades the requested sync type when the client cannot trust its
/// checkpoints.
fn effective_sync_type(requested: SyncType, scope: &Scope, server_timestamp: u64) -> SyncType {
    if requested.is_reinitialize() {
        return requested;
    }
    if scope.is_new {
        return SyncType::Reinitialize;
    }
    if scope.reinitialize_pending {
        warn!(scope = %scope.name, "previous reinitialization did not complete, reinitializing");
        return SyncType::Reinitialize;
    }
    if scope
        .last_server_sync_timestamp
        .is_some_and(|checkpoint| checkpoint > server_timestamp)
    {
        warn!(
            scope = %scope.name,
            checkpoint = ?scope.last_server_sync_timestamp,
            server_timestamp,
            "client checkpoint is ahead of the server, reinitializing"
        );
        return SyncType::Reinitialize;
    }
    requested
}
