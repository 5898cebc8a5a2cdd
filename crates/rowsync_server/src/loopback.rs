//! In-process transport.

use crate::server::SyncServer;
use async_trait::async_trait;
use rowsync_engine::{SyncError, SyncResult, SyncTransport};
use rowsync_protocol::{
    AbortSessionRequest, BeginSessionRequest, BeginSessionResponse, CleanMetadataRequest,
    CleanMetadataResponse, DownloadRequest, DownloadResponse, EndSessionRequest, UploadRequest,
    UploadResponse,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A [`SyncTransport`] that calls a [`SyncServer`] in the same process.
///
/// Batches are handed over by path, so client and server must see the same
/// file system.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
    transient_failures: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    /// Creates a transport talking to `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            transient_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Makes the next `count` calls fail with a retryable transport error
    /// before reaching the server.
    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    fn connect(&self, call: &str) -> SyncResult<()> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::transport_retryable(format!(
                "{call}: connection reset"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn begin_session(
        &self,
        request: &BeginSessionRequest,
    ) -> SyncResult<BeginSessionResponse> {
        self.connect("begin_session")?;
        Ok(self.server.begin_session(request).await?)
    }

    async fn upload(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        self.connect("upload")?;
        Ok(self.server.apply_upload(request).await?)
    }

    async fn download(&self, request: &DownloadRequest) -> SyncResult<DownloadResponse> {
        self.connect("download")?;
        Ok(self.server.select_download(request).await?)
    }

    async fn clean_metadata(
        &self,
        request: &CleanMetadataRequest,
    ) -> SyncResult<CleanMetadataResponse> {
        self.connect("clean_metadata")?;
        Ok(self.server.clean_metadata(request).await?)
    }

    async fn end_session(&self, request: &EndSessionRequest) -> SyncResult<()> {
        self.connect("end_session")?;
        Ok(self.server.end_session(request).await?)
    }

    async fn abort_session(&self, request: &AbortSessionRequest) -> SyncResult<()> {
        Ok(self.server.abort_session(request).await?)
    }
}
