//! # RowSync Engine
//!
//! Session orchestration for RowSync clients.
//!
//! This crate provides:
//! - The session stage machine and [`SyncAgent`] orchestrator
//! - Change selection into batches and batch application with conflict
//!   resolution, shared with the server
//! - Provisioning of change-tracking infrastructure from schema snapshots
//! - Retry with exponential backoff and per-call timeouts
//! - The [`SyncTransport`] abstraction
//! - A timer-driven [`SyncScheduler`]
//!
//! ## Architecture
//!
//! A session is **upload-then-download**:
//! 1. Claim the client scope and open the session on the server
//! 2. Reconcile the provisioned schema with the server schema
//! 3. Select local changes since the client checkpoint and upload them
//! 4. Download and apply server changes since the server checkpoint
//! 5. Persist both checkpoints and release the scope
//!
//! ## Key Invariants
//!
//! - Checkpoints only advance when a session completes
//! - A participant never receives rows it wrote itself
//! - Referenced tables are applied before the tables referencing them
//! - Row failures never abort a session; stage failures always do

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod config;
mod error;
mod provisioning;
mod retry;
mod scheduler;
mod session;
mod transport;

pub use changes::{apply_batch, select_into_batch, ApplyContext, ApplyReport, Direction, Selection};
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use provisioning::{ProvisionStep, Provisioner, ProvisioningOutcome};
pub use retry::{retry, with_timeout};
pub use scheduler::{Job, JobId, SyncScheduler};
pub use session::{SessionContext, SessionResult, SessionStage, SyncAgent, SyncStats};
pub use transport::SyncTransport;
