//! File-backed scope store.
//!
//! ```text
//! <root>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ scopes/           # One CBOR document per scope
//! │  └─ client-64656661756c74.cbor
//! └─ history.log       # Length-prefixed CBOR history records
//! ```
//!
//! Scope documents are replaced with write-then-rename so a crash never
//! leaves a half-written scope behind.

use super::{check_revision, HistoryEntry, Scope, ScopeRole, ScopeStore};
use crate::clock::LogicalClock;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const SCOPES_DIR: &str = "scopes";
const HISTORY_FILE: &str = "history.log";

/// A scope store persisted in a directory.
///
/// Holds an exclusive lock on the directory for its whole lifetime.
#[derive(Debug)]
pub struct FileScopeStore {
    path: PathBuf,
    clock: Arc<LogicalClock>,
    /// Serializes read-compare-write cycles within this process.
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl FileScopeStore {
    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreUnavailable`] if another process holds the
    /// directory lock.
    pub fn open(path: &Path, clock: Arc<LogicalClock>) -> CoreResult<Self> {
        fs::create_dir_all(path.join(SCOPES_DIR)).map_err(unavailable(path))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(unavailable(path))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::store_unavailable(format!(
                "scope store is locked: {}",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            clock,
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scope_path(&self, name: &str, role: ScopeRole) -> PathBuf {
        let role = match role {
            ScopeRole::Client => "client",
            ScopeRole::Server => "server",
            ScopeRole::ServerHistory => "history",
        };
        // Hex keeps arbitrary scope names filesystem-safe.
        let mut file_name = format!("{role}-");
        for byte in name.as_bytes() {
            let _ = write!(file_name, "{byte:02x}");
        }
        file_name.push_str(".cbor");
        self.path.join(SCOPES_DIR).join(file_name)
    }

    fn read_scope(path: &Path) -> CoreResult<Option<Scope>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(path)(e)),
        };
        let scope = ciborium::from_reader(data.as_slice())
            .map_err(|e| CoreError::Codec(format!("{}: {e}", path.display())))?;
        Ok(Some(scope))
    }

    fn write_scope(&self, path: &Path, scope: &Scope) -> CoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(scope, &mut data).map_err(|e| CoreError::Codec(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, path)
        };
        write().map_err(unavailable(path))
    }
}

/// Underlying I/O failures surface as an unavailable store.
fn unavailable(path: &Path) -> impl FnOnce(std::io::Error) -> CoreError + '_ {
    move |e| CoreError::store_unavailable(format!("{}: {e}", path.display()))
}

impl ScopeStore for FileScopeStore {
    fn get_scope(&self, name: &str, role: ScopeRole) -> CoreResult<Scope> {
        Self::read_scope(&self.scope_path(name, role))?.ok_or_else(|| CoreError::ScopeNotFound {
            name: name.to_string(),
            role,
        })
    }

    fn save_scope(&self, scope: &Scope) -> CoreResult<Scope> {
        let _guard = self.write_lock.lock();
        let path = self.scope_path(&scope.name, scope.role);
        let stored = Self::read_scope(&path)?;
        check_revision(stored.as_ref(), scope)?;

        let mut updated = scope.clone();
        updated.revision += 1;
        self.write_scope(&path, &updated)?;
        Ok(updated)
    }

    fn delete_scope(&self, name: &str, role: ScopeRole) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.scope_path(name, role);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(unavailable(&path)(e)),
            _ => Ok(()),
        }
    }

    fn list_scopes(&self) -> CoreResult<Vec<Scope>> {
        let mut scopes = Vec::new();
        let dir = self.path.join(SCOPES_DIR);
        for entry in fs::read_dir(&dir).map_err(unavailable(&dir))? {
            let path = entry.map_err(unavailable(&dir))?.path();
            if path.extension().is_some_and(|ext| ext == "cbor") {
                if let Some(scope) = Self::read_scope(&path)? {
                    scopes.push(scope);
                }
            }
        }
        scopes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scopes)
    }

    fn local_timestamp(&self) -> CoreResult<u64> {
        Ok(self.clock.current())
    }

    fn append_history(&self, entry: HistoryEntry) -> CoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(&entry, &mut data).map_err(|e| CoreError::Codec(e.to_string()))?;
        let len = u32::try_from(data.len())
            .map_err(|_| CoreError::Codec("history record too large".into()))?;

        let _guard = self.write_lock.lock();
        let path = self.path.join(HISTORY_FILE);
        let append = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&len.to_le_bytes())?;
            file.write_all(&data)?;
            file.sync_data()
        };
        append().map_err(unavailable(&path))
    }

    fn history(&self, name: &str) -> CoreResult<Vec<HistoryEntry>> {
        let path = self.path.join(HISTORY_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(&path)(e)),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(unavailable(&path))?;

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let mut len = [0u8; 4];
            len.copy_from_slice(&data[offset..offset + 4]);
            let len = u32::from_le_bytes(len) as usize;
            offset += 4;
            if offset + len > data.len() {
                // Torn tail from an interrupted append.
                tracing::warn!(path = %self.path.display(), "truncated history record ignored");
                break;
            }
            let entry: HistoryEntry = ciborium::from_reader(&data[offset..offset + len])
                .map_err(|e| CoreError::Codec(e.to_string()))?;
            offset += len;
            if entry.scope_name == name {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
