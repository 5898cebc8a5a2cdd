//! # RowSync Protocol
//!
//! Conflict resolution and session messages for RowSync.
//!
//! This crate provides:
//! - Conflict taxonomy, classification and resolution ([`ConflictEngine`])
//! - Session messages (BeginSession, Upload, Download, CleanMetadata,
//!   EndSession, AbortSession)
//! - Per-table statistics and row failures
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod error;
mod messages;
mod stats;

pub use codec::{from_cbor, to_cbor, CborMessage};
pub use conflict::{
    classify, resolve, Checkpoints, Conflict, ConflictEngine, ConflictPolicy, ConflictResolver,
    ConflictType, Decision, Resolution, Side,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AbortSessionRequest, BeginSessionRequest, BeginSessionResponse, CleanMetadataRequest,
    CleanMetadataResponse, DownloadRequest, DownloadResponse, EndSessionRequest, SyncMessage,
    UploadRequest, UploadResponse, PROTOCOL_VERSION,
};
pub use stats::{ApplyStats, RowFailure, TableStats};
