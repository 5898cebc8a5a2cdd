//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use rowsync_core::{
    ChangeTrackingAdapter, HistoryEntry, ProvisioningManager, Schema, Scope, ScopeRole,
    ScopeStore,
};
use rowsync_engine::{Provisioner, SyncError};
use rowsync_protocol::{
    AbortSessionRequest, BeginSessionRequest, BeginSessionResponse, CleanMetadataRequest,
    CleanMetadataResponse, ConflictResolver, DownloadRequest, DownloadResponse,
    EndSessionRequest, SyncMessage, UploadRequest, UploadResponse,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// The sync server.
///
/// Holds the authoritative scope definitions and the server data store,
/// and answers the session calls of any number of clients. Each client may
/// hold one open session per scope at a time.
///
/// # Example
///
/// ```rust,ignore
/// use rowsync_server::{LoopbackTransport, ServerConfig, SyncServer};
///
/// let server = Arc::new(SyncServer::new(config, adapter, provisioning, scopes));
/// server.register_scope("default", schema).await?;
///
/// // Clients in the same process talk to it through a loopback transport.
/// let transport = LoopbackTransport::new(Arc::clone(&server));
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    provisioner: Provisioner,
}

impl fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncServer")
            .field("server_id", &self.context.config.server_id)
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(
        config: ServerConfig,
        adapter: Arc<dyn ChangeTrackingAdapter>,
        provisioning: Arc<dyn ProvisioningManager>,
        scopes: Arc<dyn ScopeStore>,
    ) -> Self {
        Self::build(config, adapter, provisioning, scopes, None)
    }

    /// Creates a sync server whose conflicts are settled by `resolver`
    /// before the configured policy applies.
    pub fn with_resolver(
        config: ServerConfig,
        adapter: Arc<dyn ChangeTrackingAdapter>,
        provisioning: Arc<dyn ProvisioningManager>,
        scopes: Arc<dyn ScopeStore>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self::build(config, adapter, provisioning, scopes, Some(resolver))
    }

    fn build(
        config: ServerConfig,
        adapter: Arc<dyn ChangeTrackingAdapter>,
        provisioning: Arc<dyn ProvisioningManager>,
        scopes: Arc<dyn ScopeStore>,
        resolver: Option<Arc<dyn ConflictResolver>>,
    ) -> Self {
        let provisioner = Provisioner::new(provisioning, config.retry.clone());
        let context = Arc::new(HandlerContext::new(config, adapter, scopes, resolver));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self {
            handler,
            context,
            provisioner,
        }
    }

    /// Returns the server participant id.
    pub fn server_id(&self) -> Uuid {
        self.context.config.server_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Registers or updates the definition of a scope and provisions the
    /// server store to match it.
    ///
    /// # Errors
    ///
    /// Fails if the schema's foreign keys form a cycle the cycle policy
    /// forbids, or if an existing table changed its primary key.
    pub async fn register_scope(&self, name: &str, schema: Schema) -> ServerResult<Scope> {
        schema
            .dependency_order(self.context.config.cycle_policy)
            .map_err(SyncError::from)?;

        let current = self
            .context
            .scopes
            .find_scope(name, ScopeRole::Server)?
            .and_then(|scope| scope.schema);
        let outcome = self
            .provisioner
            .reconcile(current.as_ref(), &schema, &CancellationToken::new())
            .await?;

        let tables = schema.tables().len();
        let scope = self
            .context
            .update_server_scope(name, move |scope| scope.schema = Some(schema))?;
        info!(scope = name, tables, steps = outcome.steps.len(), "scope registered");
        Ok(scope)
    }

    /// Opens a session.
    pub async fn begin_session(
        &self,
        request: &BeginSessionRequest,
    ) -> ServerResult<BeginSessionResponse> {
        self.handler.handle_begin_session(request).await
    }

    /// Applies an uploaded batch.
    pub async fn apply_upload(&self, request: &UploadRequest) -> ServerResult<UploadResponse> {
        self.handler.handle_upload(request).await
    }

    /// Selects the changes to download.
    pub async fn select_download(
        &self,
        request: &DownloadRequest,
    ) -> ServerResult<DownloadResponse> {
        self.handler.handle_download(request).await
    }

    /// Purges tombstones every known client has received.
    pub async fn clean_metadata(
        &self,
        request: &CleanMetadataRequest,
    ) -> ServerResult<CleanMetadataResponse> {
        self.handler.handle_clean_metadata(request).await
    }

    /// Completes a session.
    pub async fn end_session(&self, request: &EndSessionRequest) -> ServerResult<()> {
        self.handler.handle_end_session(request).await
    }

    /// Abandons a session.
    pub async fn abort_session(&self, request: &AbortSessionRequest) -> ServerResult<()> {
        self.handler.handle_abort_session(request).await
    }

    /// Handles a decoded sync message. Calls without a response body
    /// return `None`.
    pub async fn handle_message(&self, message: SyncMessage) -> ServerResult<Option<SyncMessage>> {
        let response = match message {
            SyncMessage::BeginSessionRequest(req) => Some(SyncMessage::BeginSessionResponse(
                self.begin_session(&req).await?,
            )),
            SyncMessage::UploadRequest(req) => {
                Some(SyncMessage::UploadResponse(self.apply_upload(&req).await?))
            }
            SyncMessage::DownloadRequest(req) => {
                Some(SyncMessage::DownloadResponse(self.select_download(&req).await?))
            }
            SyncMessage::CleanMetadataRequest(req) => Some(SyncMessage::CleanMetadataResponse(
                self.clean_metadata(&req).await?,
            )),
            SyncMessage::EndSessionRequest(req) => {
                self.end_session(&req).await?;
                None
            }
            SyncMessage::AbortSessionRequest(req) => {
                self.abort_session(&req).await?;
                None
            }
            other => {
                return Err(ServerError::Internal(format!(
                    "unexpected message type {}",
                    other.type_code()
                )))
            }
        };
        Ok(response)
    }

    /// Returns the history of a scope in append order.
    pub fn history(&self, scope: &str) -> ServerResult<Vec<HistoryEntry>> {
        Ok(self.context.scopes.history(scope)?)
    }

    /// Returns the oldest server checkpoint a known client still holds.
    pub fn min_client_checkpoint(&self, scope: &str) -> ServerResult<Option<u64>> {
        Ok(self.context.scopes.min_client_checkpoint(scope)?)
    }

    /// Returns the number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.context.sessions.len()
    }

    /// Removes download batches abandoned for longer than `older_than`.
    pub fn purge_stale_batches(&self, older_than: Duration) -> ServerResult<Vec<PathBuf>> {
        Ok(self.context.batches.purge_stale(older_than)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::{CborMessage, PROTOCOL_VERSION};
    use rowsync_testkit::fixtures::{person, people_schema, shop_schema};
    use rowsync_testkit::MemoryDataStore;

    struct Fixture {
        store: Arc<MemoryDataStore>,
        server: SyncServer,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDataStore::new());
        let scopes = Arc::new(store.scope_store());
        let config = ServerConfig::default().with_batch_dir(dir.path());
        let server = SyncServer::new(config, store.clone(), store.clone(), scopes);
        Fixture {
            store,
            server,
            _dir: dir,
        }
    }

    fn begin(scope: &str) -> BeginSessionRequest {
        BeginSessionRequest::new(Uuid::new_v4(), Uuid::new_v4(), scope)
    }

    #[tokio::test]
    async fn register_provisions_and_updates() {
        let f = fixture();
        let scope = f.server.register_scope("default", people_schema()).await.unwrap();
        assert_eq!(scope.role, ScopeRole::Server);
        assert_eq!(scope.owner_id, f.server.server_id());
        assert!(f.store.has_table(&"people".into()));

        let scope = f.server.register_scope("default", shop_schema()).await.unwrap();
        assert_eq!(scope.schema, Some(shop_schema()));
        assert!(!f.store.has_table(&"people".into()));
        assert!(f.store.has_table(&"orders".into()));
    }

    #[tokio::test]
    async fn begin_rejects_unknown_scope_and_version() {
        let f = fixture();
        let err = f.server.begin_session(&begin("nope")).await.unwrap_err();
        assert!(matches!(err, ServerError::UnknownScope(ref s) if s == "nope"));

        f.server.register_scope("default", people_schema()).await.unwrap();
        let mut request = begin("default");
        request.protocol_version = PROTOCOL_VERSION + 1;
        let err = f.server.begin_session(&request).await.unwrap_err();
        assert!(matches!(err, ServerError::ProtocolVersion { .. }));
        assert_eq!(f.server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn begin_reports_schema_and_clock() {
        let f = fixture();
        f.server.register_scope("default", people_schema()).await.unwrap();
        f.store.upsert(&"people".into(), person(1, "Ada")).unwrap();

        let response = f.server.begin_session(&begin("default")).await.unwrap();
        assert_eq!(response.server_id, f.server.server_id());
        assert_eq!(response.schema, people_schema());
        assert_eq!(response.server_timestamp, f.store.clock().current());
        assert_eq!(f.server.active_sessions(), 1);
    }

    #[tokio::test]
    async fn calls_on_unknown_sessions_fail() {
        let f = fixture();
        let session_id = Uuid::new_v4();
        let err = f
            .server
            .clean_metadata(&CleanMetadataRequest { session_id })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::UnknownSession(id) if id == session_id));

        // Aborting is idempotent.
        f.server
            .abort_session(&AbortSessionRequest {
                session_id,
                reason: "gone".into(),
                cancelled: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn message_dispatch() {
        let f = fixture();
        f.server.register_scope("default", people_schema()).await.unwrap();

        let request = begin("default");
        let session_id = request.session_id;
        let bytes = SyncMessage::BeginSessionRequest(request).encode().unwrap();
        let response = f
            .server
            .handle_message(SyncMessage::decode(&bytes).unwrap())
            .await
            .unwrap();
        assert!(matches!(response, Some(SyncMessage::BeginSessionResponse(_))));

        let response = f
            .server
            .handle_message(SyncMessage::AbortSessionRequest(AbortSessionRequest {
                session_id,
                reason: "test".into(),
                cancelled: true,
            }))
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(f.server.active_sessions(), 0);

        let history = f.server.history("default").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, rowsync_core::SessionOutcome::Cancelled);

        let err = f
            .server
            .handle_message(SyncMessage::UploadResponse(UploadResponse::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Internal(_)));
    }
}
