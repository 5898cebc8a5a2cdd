//! Transport layer abstraction for sync sessions.

use crate::error::SyncResult;
use async_trait::async_trait;
use rowsync_protocol::{
    AbortSessionRequest, BeginSessionRequest, BeginSessionResponse, CleanMetadataRequest,
    CleanMetadataResponse, DownloadRequest, DownloadResponse, EndSessionRequest, UploadRequest,
    UploadResponse,
};

/// A sync transport carries session calls to the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (in-process loopback, HTTP, test doubles). Calls must be
/// safe to retry: the orchestrator repeats a call that failed with a
/// retryable error.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Opens a session on the server.
    async fn begin_session(&self, request: &BeginSessionRequest)
        -> SyncResult<BeginSessionResponse>;

    /// Sends the client's changes.
    async fn upload(&self, request: &UploadRequest) -> SyncResult<UploadResponse>;

    /// Fetches the server's changes.
    async fn download(&self, request: &DownloadRequest) -> SyncResult<DownloadResponse>;

    /// Asks the server to purge tombstones no client still needs.
    async fn clean_metadata(
        &self,
        request: &CleanMetadataRequest,
    ) -> SyncResult<CleanMetadataResponse>;

    /// Completes a session.
    async fn end_session(&self, request: &EndSessionRequest) -> SyncResult<()>;

    /// Abandons a session.
    async fn abort_session(&self, request: &AbortSessionRequest) -> SyncResult<()>;
}
