//! Protocol messages exchanged between a client and the server during a
//! session.
//!
//! A session is a fixed sequence of calls:
//!
//! ```text
//! BeginSession → Upload → Download → [CleanMetadata] → EndSession
//!                    └──────── AbortSession on any failure ───────┘
//! ```

use crate::codec::CborMessage;
use crate::conflict::Conflict;
use crate::stats::{ApplyStats, RowFailure};
use rowsync_batch::BatchInfo;
use rowsync_core::{Schema, SyncType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Begin session request.
    BeginSessionRequest(BeginSessionRequest),
    /// Begin session response.
    BeginSessionResponse(BeginSessionResponse),
    /// Upload request.
    UploadRequest(UploadRequest),
    /// Upload response.
    UploadResponse(UploadResponse),
    /// Download request.
    DownloadRequest(DownloadRequest),
    /// Download response.
    DownloadResponse(DownloadResponse),
    /// Metadata cleanup request.
    CleanMetadataRequest(CleanMetadataRequest),
    /// Metadata cleanup response.
    CleanMetadataResponse(CleanMetadataResponse),
    /// End session request.
    EndSessionRequest(EndSessionRequest),
    /// Abort session request.
    AbortSessionRequest(AbortSessionRequest),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::BeginSessionRequest(_) => 1,
            SyncMessage::BeginSessionResponse(_) => 2,
            SyncMessage::UploadRequest(_) => 3,
            SyncMessage::UploadResponse(_) => 4,
            SyncMessage::DownloadRequest(_) => 5,
            SyncMessage::DownloadResponse(_) => 6,
            SyncMessage::CleanMetadataRequest(_) => 7,
            SyncMessage::CleanMetadataResponse(_) => 8,
            SyncMessage::EndSessionRequest(_) => 9,
            SyncMessage::AbortSessionRequest(_) => 10,
        }
    }
}

impl CborMessage for SyncMessage {}

/// Opens a session on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginSessionRequest {
    /// Protocol version spoken by the client.
    pub protocol_version: u16,
    /// Session id chosen by the client.
    pub session_id: Uuid,
    /// Client participant id.
    pub client_id: Uuid,
    /// Scope to synchronize.
    pub scope_name: String,
    /// Client clock at its last completed session.
    pub last_client_checkpoint: Option<u64>,
    /// Server clock checkpoint the client received at its last completed
    /// session.
    pub last_server_checkpoint: Option<u64>,
}

impl BeginSessionRequest {
    /// Creates a request for the current protocol version.
    pub fn new(session_id: Uuid, client_id: Uuid, scope_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            client_id,
            scope_name: scope_name.into(),
            last_client_checkpoint: None,
            last_server_checkpoint: None,
        }
    }

    /// Sets the checkpoints the client holds.
    pub fn with_checkpoints(mut self, client: Option<u64>, server: Option<u64>) -> Self {
        self.last_client_checkpoint = client;
        self.last_server_checkpoint = server;
        self
    }
}

/// Server answer to [`BeginSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginSessionResponse {
    /// Server participant id; rows the client writes on behalf of the
    /// server carry this origin.
    pub server_id: Uuid,
    /// Current server schema of the scope.
    pub schema: Schema,
    /// Current server clock.
    pub server_timestamp: u64,
}

/// Sends the client's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Finished batch of client changes.
    pub batch: BatchInfo,
}

/// Result of applying an upload on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Per-table counts.
    pub stats: ApplyStats,
    /// Rows the server could not apply.
    pub failures: Vec<RowFailure>,
    /// Conflicts the server left unresolved.
    pub conflicts: Vec<Conflict>,
}

/// Asks for the server's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Effective sync type; reinitialization downloads every live row.
    pub sync_type: SyncType,
}

/// The server's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResponse {
    /// Finished batch of server changes.
    pub batch: BatchInfo,
    /// Server clock captured before selecting; the client's next server
    /// checkpoint.
    pub server_timestamp: u64,
}

/// Asks the server to purge tombstones no client still needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanMetadataRequest {
    /// Session id.
    pub session_id: Uuid,
}

/// Result of a server metadata cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanMetadataResponse {
    /// Tombstones removed.
    pub purged: u64,
    /// Oldest checkpoint still held by a known client.
    pub min_checkpoint: Option<u64>,
}

/// Completes a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Effective sync type.
    pub sync_type: SyncType,
    /// Server checkpoint the client now holds.
    pub server_checkpoint: u64,
    /// Rows the client applied from the download.
    pub rows_downloaded: u64,
    /// Download rows that failed or stayed unresolved on the client.
    pub rows_failed: u64,
}

/// Abandons a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortSessionRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Why the session failed.
    pub reason: String,
    /// True if the client cancelled the session.
    pub cancelled: bool,
}
