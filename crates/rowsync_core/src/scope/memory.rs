//! In-memory scope store for testing and ephemeral participants.

use super::{check_revision, HistoryEntry, Scope, ScopeRole, ScopeStore};
use crate::clock::LogicalClock;
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A scope store that keeps everything in memory.
///
/// The store reports the value of the [`LogicalClock`] it was built with,
/// which is normally shared with the data store it sits next to.
#[derive(Debug, Default)]
pub struct MemoryScopeStore {
    scopes: RwLock<HashMap<(String, ScopeRole), Scope>>,
    history: RwLock<Vec<HistoryEntry>>,
    clock: Arc<LogicalClock>,
}

impl MemoryScopeStore {
    /// Creates an empty store with its own clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store reporting `clock`.
    pub fn with_clock(clock: Arc<LogicalClock>) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }
}

impl ScopeStore for MemoryScopeStore {
    fn get_scope(&self, name: &str, role: ScopeRole) -> CoreResult<Scope> {
        self.scopes
            .read()
            .get(&(name.to_string(), role))
            .cloned()
            .ok_or_else(|| CoreError::ScopeNotFound {
                name: name.to_string(),
                role,
            })
    }

    fn save_scope(&self, scope: &Scope) -> CoreResult<Scope> {
        let mut scopes = self.scopes.write();
        let key = (scope.name.clone(), scope.role);
        check_revision(scopes.get(&key), scope)?;

        let mut stored = scope.clone();
        stored.revision += 1;
        scopes.insert(key, stored.clone());
        Ok(stored)
    }

    fn delete_scope(&self, name: &str, role: ScopeRole) -> CoreResult<()> {
        self.scopes.write().remove(&(name.to_string(), role));
        Ok(())
    }

    fn list_scopes(&self) -> CoreResult<Vec<Scope>> {
        let mut scopes: Vec<Scope> = self.scopes.read().values().cloned().collect();
        scopes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scopes)
    }

    fn local_timestamp(&self) -> CoreResult<u64> {
        Ok(self.clock.current())
    }

    fn append_history(&self, entry: HistoryEntry) -> CoreResult<()> {
        self.history.write().push(entry);
        Ok(())
    }

    fn history(&self, name: &str) -> CoreResult<Vec<HistoryEntry>> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|e| e.scope_name == name)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn save_and_get() {
        let store = MemoryScopeStore::new();
        let scope = Scope::new("default", ScopeRole::Client, Uuid::new_v4());

        assert!(matches!(
            store.get_scope("default", ScopeRole::Client),
            Err(CoreError::ScopeNotFound { .. })
        ));

        let saved = store.save_scope(&scope).unwrap();
        assert_eq!(saved.revision, 1);
        assert_eq!(store.get_scope("default", ScopeRole::Client).unwrap(), saved);
        assert!(store
            .find_scope("default", ScopeRole::Server)
            .unwrap()
            .is_none());
    }

    #[test]
    fn stale_revision_is_rejected() {
        let store = MemoryScopeStore::new();
        let first = store
            .save_scope(&Scope::new("default", ScopeRole::Client, Uuid::new_v4()))
            .unwrap();

        let mut a = first.clone();
        a.last_sync_timestamp = Some(10);
        store.save_scope(&a).unwrap();

        let mut b = first;
        b.last_sync_timestamp = Some(20);
        let err = store.save_scope(&b).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn double_insert_is_rejected() {
        let store = MemoryScopeStore::new();
        let scope = Scope::new("default", ScopeRole::Client, Uuid::new_v4());
        store.save_scope(&scope).unwrap();
        assert!(store.save_scope(&scope).is_err());
    }

    #[test]
    fn reports_shared_clock() {
        let clock = Arc::new(LogicalClock::new());
        let store = MemoryScopeStore::with_clock(Arc::clone(&clock));
        clock.tick();
        clock.tick();
        assert_eq!(store.local_timestamp().unwrap(), 2);
    }
}
