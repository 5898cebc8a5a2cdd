//! Batch creation, disposal and cleanup.

use crate::error::{BatchError, BatchResult};
use crate::info::{checksum, BatchInfo, BatchPartInfo, PartFile, MANIFEST_FILE};
use rowsync_core::{Schema, TableName, TrackedRow};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default number of rows per part.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Configuration for the batch engine.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Directory under which batch directories are created.
    pub root: PathBuf,
    /// Rows per part before the part is sealed.
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("rowsync-batches"),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl BatchConfig {
    /// Creates a configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Sets the part size. A size of 0 is treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Creates and removes batch directories.
#[derive(Debug, Clone)]
pub struct BatchEngine {
    config: BatchConfig,
}

impl BatchEngine {
    /// Creates an engine.
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Allocates a fresh, empty batch directory.
    pub fn create_batch(&self, schema: &Schema) -> BatchResult<BatchWriter> {
        fs::create_dir_all(&self.config.root)?;

        // Retry on the (unlikely) collision of millis and random suffix.
        loop {
            let name = format!("{}_{:08x}", unix_millis(SystemTime::now()), rand::random::<u32>());
            match fs::create_dir(self.config.root.join(&name)) {
                Ok(()) => {
                    tracing::debug!(batch = %name, "batch created");
                    return Ok(BatchWriter::new(
                        BatchInfo {
                            directory_root: self.config.root.clone(),
                            directory_name: name,
                            schema: schema.clone(),
                            parts: Vec::new(),
                            finished: false,
                        },
                        self.config.batch_size,
                    ));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Deletes a batch directory. Disposing a missing or partially written
    /// batch succeeds.
    pub fn dispose(&self, batch: &BatchInfo) -> BatchResult<()> {
        remove_batch_dir(&batch.path())
    }

    /// Lists batch directories under the root created more than
    /// `older_than` ago.
    pub fn stale_batches(&self, older_than: Duration) -> BatchResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let cutoff = unix_millis(SystemTime::now()).saturating_sub(older_than.as_millis());

        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(created) = parse_created_millis(&name.to_string_lossy()) {
                if created < cutoff {
                    stale.push(entry.path());
                }
            }
        }
        stale.sort();
        Ok(stale)
    }

    /// Removes batch directories abandoned for longer than `older_than`
    /// and returns their paths.
    pub fn purge_stale(&self, older_than: Duration) -> BatchResult<Vec<PathBuf>> {
        let stale = self.stale_batches(older_than)?;
        for dir in &stale {
            remove_batch_dir(dir)?;
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "purged stale batches");
        }
        Ok(stale)
    }
}

/// Accumulates rows into sealed parts of a batch.
#[derive(Debug)]
pub struct BatchWriter {
    info: BatchInfo,
    batch_size: usize,
    in_flight: Vec<(TableName, Vec<TrackedRow>)>,
    next_sequence: HashMap<TableName, u32>,
}

impl BatchWriter {
    fn new(info: BatchInfo, batch_size: usize) -> Self {
        Self {
            info,
            batch_size: batch_size.max(1),
            in_flight: Vec::new(),
            next_sequence: HashMap::new(),
        }
    }

    /// Returns the batch being written.
    pub fn info(&self) -> &BatchInfo {
        &self.info
    }

    /// Appends rows for `table`, sealing a part each time the in-flight
    /// part reaches the batch size. Returns the parts sealed by this call.
    pub fn add_part(
        &mut self,
        table: &TableName,
        rows: impl IntoIterator<Item = TrackedRow>,
    ) -> BatchResult<Vec<BatchPartInfo>> {
        let slot = match self.in_flight.iter().position(|(t, _)| t == table) {
            Some(slot) => slot,
            None => {
                self.in_flight.push((table.clone(), Vec::new()));
                self.in_flight.len() - 1
            }
        };

        let mut sealed = Vec::new();
        for row in rows {
            self.in_flight[slot].1.push(row);
            if self.in_flight[slot].1.len() >= self.batch_size {
                let full = std::mem::take(&mut self.in_flight[slot].1);
                sealed.push(self.seal(table, full)?);
            }
        }
        Ok(sealed)
    }

    /// Seals the remaining in-flight parts, marks the final part and writes
    /// the manifest.
    pub fn finish(mut self) -> BatchResult<BatchInfo> {
        for (table, rows) in std::mem::take(&mut self.in_flight) {
            if !rows.is_empty() {
                self.seal(&table, rows)?;
            }
        }
        if let Some(last) = self.info.parts.last_mut() {
            last.is_last_batch = true;
        }
        self.info.finished = true;

        let mut data = Vec::new();
        ciborium::into_writer(&self.info, &mut data).map_err(BatchError::codec)?;
        write_durable(&self.info.path().join(MANIFEST_FILE), &data)?;

        tracing::debug!(
            batch = %self.info.directory_name,
            parts = self.info.parts.len(),
            rows = self.info.row_count(),
            "batch finished"
        );
        Ok(self.info)
    }

    /// Abandons the batch, deleting its directory.
    pub fn abort(self) -> BatchResult<()> {
        remove_batch_dir(&self.info.path())
    }

    fn seal(&mut self, table: &TableName, rows: Vec<TrackedRow>) -> BatchResult<BatchPartInfo> {
        let sequence = {
            let next = self.next_sequence.entry(table.clone()).or_insert(0);
            *next += 1;
            *next
        };
        let index = u32::try_from(self.info.parts.len() + 1)
            .map_err(|_| BatchError::Codec("too many batch parts".into()))?;
        let row_count = rows.len();
        let file_name = format!("part_{index:06}.cbor");

        let mut data = Vec::new();
        ciborium::into_writer(
            &PartFile {
                table: table.clone(),
                sequence,
                rows,
            },
            &mut data,
        )
        .map_err(BatchError::codec)?;
        write_durable(&self.info.path().join(&file_name), &data)?;

        let part = BatchPartInfo {
            table: table.clone(),
            index,
            sequence,
            is_last_batch: false,
            row_count,
            file_name,
            checksum: checksum(&data),
        };
        self.info.parts.push(part.clone());
        Ok(part)
    }
}

fn write_durable(path: &Path, data: &[u8]) -> BatchResult<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn remove_batch_dir(path: &Path) -> BatchResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "batch disposed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn unix_millis(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn parse_created_millis(name: &str) -> Option<u128> {
    let (millis, suffix) = name.split_once('_')?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    millis.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{Column, ColumnType, Row, Table};
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(vec![Table::new(
            "t",
            vec![Column::new("id", ColumnType::Integer)],
            vec!["id".into()],
        )
        .unwrap()])
        .unwrap()
    }

    fn rows(n: i64) -> Vec<TrackedRow> {
        (0..n)
            .map(|i| TrackedRow::live(Row::new().with("id", i), i as u64 + 1, None))
            .collect()
    }

    #[test]
    fn seals_parts_at_batch_size() {
        let dir = tempdir().unwrap();
        let engine = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(100));
        let mut writer = engine.create_batch(&schema()).unwrap();

        let sealed = writer.add_part(&"t".into(), rows(250)).unwrap();
        assert_eq!(sealed.len(), 2);

        let info = writer.finish().unwrap();
        let counts: Vec<usize> = info.parts.iter().map(|p| p.row_count).collect();
        assert_eq!(counts, vec![100, 100, 50]);
        let last: Vec<bool> = info.parts.iter().map(|p| p.is_last_batch).collect();
        assert_eq!(last, vec![false, false, true]);
        let sequences: Vec<u32> = info.parts.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        info.ensure_complete().unwrap();
    }

    #[test]
    fn dispose_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = BatchEngine::new(BatchConfig::new(dir.path()));
        let mut writer = engine.create_batch(&schema()).unwrap();
        writer.add_part(&"t".into(), rows(3)).unwrap();
        let info = writer.finish().unwrap();

        engine.dispose(&info).unwrap();
        assert!(!info.path().exists());
        engine.dispose(&info).unwrap();
    }

    #[test]
    fn directory_names_are_unique() {
        let dir = tempdir().unwrap();
        let engine = BatchEngine::new(BatchConfig::new(dir.path()));
        let a = engine.create_batch(&schema()).unwrap();
        let b = engine.create_batch(&schema()).unwrap();
        assert_ne!(a.info().directory_name, b.info().directory_name);
        assert!(parse_created_millis(&a.info().directory_name).is_some());
    }

    #[test]
    fn stale_batches_by_age() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("1000_deadbeef")).unwrap();
        fs::create_dir(dir.path().join("not-a-batch")).unwrap();
        let engine = BatchEngine::new(BatchConfig::new(dir.path()));
        engine.create_batch(&schema()).unwrap();

        let stale = engine.stale_batches(Duration::from_secs(3600)).unwrap();
        assert_eq!(stale, vec![dir.path().join("1000_deadbeef")]);

        let purged = engine.purge_stale(Duration::from_secs(3600)).unwrap();
        assert_eq!(purged.len(), 1);
        assert!(!dir.path().join("1000_deadbeef").exists());
        assert!(dir.path().join("not-a-batch").exists());
    }

    #[test]
    fn empty_batch_is_complete_once_finished() {
        let dir = tempdir().unwrap();
        let engine = BatchEngine::new(BatchConfig::new(dir.path()));
        let info = engine.create_batch(&schema()).unwrap().finish().unwrap();
        assert!(info.is_empty());
        info.ensure_complete().unwrap();
    }
}
