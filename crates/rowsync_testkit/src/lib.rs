//! # RowSync Testkit
//!
//! Test utilities for RowSync.
//!
//! This crate provides:
//! - [`MemoryDataStore`], an in-memory change-tracked store implementing the
//!   adapter and provisioning contracts
//! - Table, schema and row fixtures
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rowsync_testkit::prelude::*;
//!
//! let store = MemoryDataStore::new();
//! store.provision_now(&shop_schema());
//! store.upsert(&"customers".into(), customer(1, "ada"))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::store::*;
}

pub use store::{AppliedWrite, MemoryDataStore};
