//! Batch descriptors and part access.

use crate::error::{BatchError, BatchResult};
use rowsync_core::{CyclePolicy, Schema, TableName, TrackedRow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File name of the manifest written into every finished batch directory.
pub const MANIFEST_FILE: &str = "batch.info";

/// One sealed part of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// Table the rows belong to.
    pub table: TableName,
    /// Position of the part in the whole batch.
    pub index: u32,
    /// Position of the part among the parts of its table.
    pub sequence: u32,
    /// True for the final part of the batch.
    pub is_last_batch: bool,
    /// Number of rows in the part.
    pub row_count: usize,
    /// Part file name inside the batch directory.
    pub file_name: String,
    /// Hex SHA-256 of the part file.
    pub checksum: String,
}

/// Contents of a part file.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PartFile {
    pub(crate) table: TableName,
    pub(crate) sequence: u32,
    pub(crate) rows: Vec<TrackedRow>,
}

/// Describes one changeset transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Directory holding all batch directories.
    pub directory_root: PathBuf,
    /// Directory of this batch, `{unix_millis}_{random hex}`.
    pub directory_name: String,
    /// Schema the rows were selected with.
    pub schema: Schema,
    /// Sealed parts in the order they were written.
    pub parts: Vec<BatchPartInfo>,
    /// Set once the writer has finished.
    pub finished: bool,
}

impl BatchInfo {
    /// Returns the batch directory.
    pub fn path(&self) -> PathBuf {
        self.directory_root.join(&self.directory_name)
    }

    /// Returns the total number of rows across all parts.
    pub fn row_count(&self) -> usize {
        self.parts.iter().map(|p| p.row_count).sum()
    }

    /// Returns true if the batch has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns the tables that have at least one part, in first-written
    /// order.
    pub fn tables(&self) -> Vec<&TableName> {
        let mut tables: Vec<&TableName> = Vec::new();
        for part in &self.parts {
            if !tables.contains(&&part.table) {
                tables.push(&part.table);
            }
        }
        tables
    }

    /// Reloads a batch from the manifest in `dir`.
    ///
    /// The batch root is taken from `dir` itself, so a batch directory can
    /// be moved as a unit.
    pub fn load(dir: &Path) -> BatchResult<Self> {
        let data = match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BatchError::incomplete(format!(
                    "no manifest in {}",
                    dir.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let mut info: BatchInfo = ciborium::from_reader(data.as_slice()).map_err(BatchError::codec)?;
        if let (Some(root), Some(name)) = (dir.parent(), dir.file_name()) {
            info.directory_root = root.to_path_buf();
            info.directory_name = name.to_string_lossy().into_owned();
        }
        Ok(info)
    }

    /// Returns the parts in consumption order: tables in foreign-key
    /// dependency order, then each table's parts by ascending sequence.
    ///
    /// Only tables that have parts are visited. Tables missing from the
    /// batch schema come last, in first-written order. Calling this again
    /// restarts the enumeration.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Core`] with a schema cycle error when the
    /// schema's foreign keys form a cycle and `policy` is
    /// [`CyclePolicy::Fail`].
    pub fn enumerate_parts(
        &self,
        policy: CyclePolicy,
    ) -> BatchResult<impl Iterator<Item = &BatchPartInfo> + '_> {
        let present = self.tables();
        let mut order: Vec<&TableName> = Vec::with_capacity(present.len());
        for name in self.schema.dependency_order(policy)? {
            if let Some(table) = present.iter().find(|t| ***t == name) {
                order.push(*table);
            }
        }
        for table in present {
            if !order.contains(&table) {
                order.push(table);
            }
        }

        Ok(order.into_iter().flat_map(move |table| {
            let mut parts: Vec<&BatchPartInfo> =
                self.parts.iter().filter(|p| &p.table == table).collect();
            parts.sort_by_key(|p| p.sequence);
            parts
        }))
    }

    /// Reads the rows of a part, verifying its checksum.
    pub fn load_part(&self, part: &BatchPartInfo) -> BatchResult<Vec<TrackedRow>> {
        let path = self.path().join(&part.file_name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BatchError::MissingPart {
                    file: part.file_name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let actual = checksum(&data);
        if actual != part.checksum {
            return Err(BatchError::ChecksumMismatch {
                file: part.file_name.clone(),
                expected: part.checksum.clone(),
                actual,
            });
        }

        let file: PartFile = ciborium::from_reader(data.as_slice()).map_err(BatchError::codec)?;
        if file.table != part.table || file.sequence != part.sequence {
            return Err(BatchError::Codec(format!(
                "{} holds {} #{}, manifest says {} #{}",
                part.file_name, file.table, file.sequence, part.table, part.sequence
            )));
        }
        Ok(file.rows)
    }

    /// Checks that every declared part is on disk and the last part was
    /// seen.
    pub fn ensure_complete(&self) -> BatchResult<()> {
        if !self.finished {
            return Err(BatchError::incomplete("batch was never finished"));
        }
        match self.parts.last() {
            Some(last) if !last.is_last_batch => {
                return Err(BatchError::incomplete("last part not marked"));
            }
            _ => {}
        }
        if self.parts.iter().filter(|p| p.is_last_batch).count() > 1 {
            return Err(BatchError::incomplete("more than one last part"));
        }
        let dir = self.path();
        for part in &self.parts {
            if !dir.join(&part.file_name).is_file() {
                return Err(BatchError::MissingPart {
                    file: part.file_name.clone(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
