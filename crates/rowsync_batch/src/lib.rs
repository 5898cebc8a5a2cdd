//! # RowSync Batch
//!
//! Disk-backed changesets.
//!
//! A batch is a directory named `{unix_millis}_{random hex}` holding one
//! CBOR file per sealed part plus a `batch.info` manifest:
//!
//! ```text
//! <root>/1718000000000_3f2a91c0/
//! ├─ part_000001.cbor
//! ├─ part_000002.cbor
//! └─ batch.info
//! ```
//!
//! Rows are buffered per table and sealed into a part whenever the table's
//! in-flight part reaches the batch size, so memory stays proportional to
//! the batch size rather than to the whole changeset.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod info;
mod reader;

pub use engine::{BatchConfig, BatchEngine, BatchWriter, DEFAULT_BATCH_SIZE};
pub use error::{BatchError, BatchResult};
pub use info::{BatchInfo, BatchPartInfo, MANIFEST_FILE};
pub use reader::BatchReader;
