//! # RowSync Server
//!
//! Server participant for RowSync.
//!
//! This crate provides:
//! - Registered scope definitions and server-side provisioning
//! - Session table (one live session per client and scope)
//! - Upload application and download selection over the shared change
//!   pipeline
//! - Per-client history and tombstone cleanup below the oldest client
//!   checkpoint
//! - An in-process [`LoopbackTransport`]
//!
//! # Protocol
//!
//! Each session runs upload-then-download:
//! 1. The client begins a session and receives the server schema and clock
//! 2. The client uploads its changes; the server applies them with its
//!    conflict policy
//! 3. The client downloads every change it has not seen, except its own
//! 4. The client ends the session; the server records the new checkpoint

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod handler;
mod loopback;
mod server;
mod sessions;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use loopback::LoopbackTransport;
pub use server::SyncServer;
