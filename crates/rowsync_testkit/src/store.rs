//! In-memory change-tracked data store.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rowsync_core::{
    AdapterError, AdapterResult, ApplyFailure, ApplyOutcome, ChangeTrackingAdapter, LogicalClock,
    MemoryScopeStore, ProvisioningManager, Row, RowKey, Schema, Table, TableChange, TableName,
    TrackedRow,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// One write performed through [`ChangeTrackingAdapter::apply_row`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedWrite {
    /// Table written.
    pub table: TableName,
    /// Key written.
    pub key: RowKey,
    /// Timestamp assigned to the write.
    pub timestamp: u64,
    /// Whether the write recorded a deletion.
    pub tombstone: bool,
}

#[derive(Debug)]
struct TableData {
    definition: Table,
    rows: BTreeMap<RowKey, TrackedRow>,
}

/// A change-tracked store kept entirely in memory.
///
/// Every write, local or applied, takes a fresh value from the store's
/// [`LogicalClock`]. The clock can be shared with a [`MemoryScopeStore`]
/// through [`MemoryDataStore::scope_store`].
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    clock: Arc<LogicalClock>,
    tables: RwLock<HashMap<TableName, TableData>>,
    unique: RwLock<HashMap<TableName, Vec<String>>>,
    transient_failures: AtomicUsize,
    trace: Mutex<Vec<AppliedWrite>>,
}

impl MemoryDataStore {
    /// Creates an empty, unprovisioned store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store's clock.
    pub fn clock(&self) -> Arc<LogicalClock> {
        Arc::clone(&self.clock)
    }

    /// Creates a scope store that reports this store's clock.
    pub fn scope_store(&self) -> MemoryScopeStore {
        MemoryScopeStore::with_clock(self.clock())
    }

    /// Provisions every table of `schema` without going through the async
    /// provisioning contract.
    pub fn provision_now(&self, schema: &Schema) {
        let mut tables = self.tables.write();
        for table in schema.tables() {
            tables.entry(table.name.clone()).or_insert_with(|| TableData {
                definition: table.clone(),
                rows: BTreeMap::new(),
            });
        }
    }

    /// Declares a unique constraint on a non-key column.
    pub fn with_unique(self, table: impl Into<TableName>, column: impl Into<String>) -> Self {
        self.unique
            .write()
            .entry(table.into())
            .or_default()
            .push(column.into());
        self
    }

    /// Makes the next `count` adapter calls fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Returns the writes performed through `apply_row`, in order.
    pub fn applied_writes(&self) -> Vec<AppliedWrite> {
        self.trace.lock().clone()
    }

    /// Clears the apply trace.
    pub fn clear_trace(&self) {
        self.trace.lock().clear();
    }

    /// Inserts or updates a row as a local write. Returns the assigned
    /// timestamp.
    pub fn upsert(&self, table: &TableName, row: Row) -> AdapterResult<u64> {
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table)?;
        row.validate(&data.definition)
            .map_err(|e| AdapterError::permanent(e.to_string()))?;
        let key = key_of(&data.definition, &row)?;
        if let Some(reason) = self.unique_violation(table, data, &key, &row) {
            return Err(AdapterError::permanent(reason));
        }
        let timestamp = self.clock.tick();
        data.rows
            .insert(key, TrackedRow::live(row, timestamp, None));
        Ok(timestamp)
    }

    /// Deletes a row as a local write, leaving a tombstone. Returns the
    /// assigned timestamp, or `None` if the row does not exist.
    pub fn delete(&self, table: &TableName, key: &RowKey) -> AdapterResult<Option<u64>> {
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table)?;
        match data.rows.get(key) {
            Some(existing) if !existing.is_tombstone() => {
                let timestamp = self.clock.tick();
                let row = existing.row.key_only(&data.definition);
                data.rows
                    .insert(key.clone(), TrackedRow::tombstone(row, timestamp, None));
                Ok(Some(timestamp))
            }
            _ => Ok(None),
        }
    }

    /// Returns the live rows of a table in key order.
    pub fn rows(&self, table: &TableName) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|data| {
                data.rows
                    .values()
                    .filter(|r| !r.is_tombstone())
                    .map(|r| r.row.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns every row of a table, tombstones included, in key order.
    pub fn tracked_rows(&self, table: &TableName) -> Vec<TrackedRow> {
        self.tables
            .read()
            .get(table)
            .map(|data| data.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns a row (live or tombstone) by key.
    pub fn tracked_row(&self, table: &TableName, key: &RowKey) -> Option<TrackedRow> {
        self.tables
            .read()
            .get(table)
            .and_then(|data| data.rows.get(key).cloned())
    }

    /// Returns true if the table is provisioned.
    pub fn has_table(&self, table: &TableName) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Returns the provisioned definition of a table.
    pub fn definition(&self, table: &TableName) -> Option<Table> {
        self.tables
            .read()
            .get(table)
            .map(|data| data.definition.clone())
    }

    fn take_transient_failure(&self) -> AdapterResult<()> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            tracing::debug!("injecting transient adapter failure");
            Err(AdapterError::transient("injected transient failure"))
        } else {
            Ok(())
        }
    }

    fn unique_violation(
        &self,
        table: &TableName,
        data: &TableData,
        key: &RowKey,
        row: &Row,
    ) -> Option<String> {
        let unique = self.unique.read();
        let columns = unique.get(table)?;
        for column in columns {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = data.rows.iter().any(|(other_key, other)| {
                other_key != key && !other.is_tombstone() && other.row.get(column) == Some(value)
            });
            if clash {
                return Some(format!("duplicate value {value} for unique column {column}"));
            }
        }
        None
    }
}

fn table_mut<'a>(
    tables: &'a mut HashMap<TableName, TableData>,
    table: &TableName,
) -> AdapterResult<&'a mut TableData> {
    tables
        .get_mut(table)
        .ok_or_else(|| AdapterError::permanent(format!("table {table} is not provisioned")))
}

fn key_of(table: &Table, row: &Row) -> AdapterResult<RowKey> {
    row.key(table)
        .map_err(|e| AdapterError::permanent(e.to_string()))
}

#[async_trait]
impl ChangeTrackingAdapter for MemoryDataStore {
    async fn select_changes(
        &self,
        table: &TableName,
        since: Option<u64>,
        exclude_origin: Option<Uuid>,
    ) -> AdapterResult<BoxStream<'static, AdapterResult<TrackedRow>>> {
        self.take_transient_failure()?;
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| AdapterError::permanent(format!("table {table} is not provisioned")))?;

        let mut rows: Vec<TrackedRow> = data
            .rows
            .values()
            .filter(|r| r.metadata.changed_since(since))
            .filter(|r| !exclude_origin.is_some_and(|origin| r.metadata.written_by(origin)))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.metadata.update_timestamp);
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn get_row(&self, table: &TableName, key: &RowKey) -> AdapterResult<Option<TrackedRow>> {
        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| AdapterError::permanent(format!("table {table} is not provisioned")))?;
        Ok(data.rows.get(key).cloned())
    }

    async fn apply_row(
        &self,
        table: &TableName,
        row: &TrackedRow,
        expected_prior: Option<u64>,
    ) -> AdapterResult<ApplyOutcome> {
        self.take_transient_failure()?;
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table)?;
        let key = key_of(&data.definition, &row.row)?;

        let current = data.rows.get(&key);
        if current.map(|c| c.metadata.update_timestamp) != expected_prior {
            return Ok(ApplyOutcome::Conflicted(current.cloned()));
        }

        let stored = if row.is_tombstone() {
            TrackedRow::tombstone(
                row.row.key_only(&data.definition),
                0,
                row.metadata.update_scope_id,
            )
        } else {
            if let Err(e) = row.row.validate(&data.definition) {
                return Ok(ApplyOutcome::Failed(ApplyFailure::other(e.to_string())));
            }
            if let Some(reason) = self.unique_violation(table, data, &key, &row.row) {
                return Ok(ApplyOutcome::Failed(ApplyFailure::unique_key(reason)));
            }
            TrackedRow::live(row.row.clone(), 0, row.metadata.update_scope_id)
        };

        let timestamp = self.clock.tick();
        let mut stored = stored;
        stored.metadata.update_timestamp = timestamp;
        self.trace.lock().push(AppliedWrite {
            table: table.clone(),
            key: key.clone(),
            timestamp,
            tombstone: stored.is_tombstone(),
        });
        data.rows.insert(key, stored);
        Ok(ApplyOutcome::Applied)
    }

    async fn local_timestamp(&self) -> AdapterResult<u64> {
        Ok(self.clock.current())
    }

    async fn purge_tombstones(&self, table: &TableName, older_than: u64) -> AdapterResult<u64> {
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, table)?;
        let before = data.rows.len();
        data.rows
            .retain(|_, r| !(r.is_tombstone() && r.metadata.update_timestamp < older_than));
        Ok((before - data.rows.len()) as u64)
    }

    async fn reset_table(&self, table: &TableName) -> AdapterResult<()> {
        let mut tables = self.tables.write();
        table_mut(&mut tables, table)?.rows.clear();
        Ok(())
    }
}

#[async_trait]
impl ProvisioningManager for MemoryDataStore {
    async fn ensure_tracking_infrastructure(&self, schema: &Schema) -> AdapterResult<()> {
        self.take_transient_failure()?;
        self.provision_now(schema);
        Ok(())
    }

    async fn alter_tracking_infrastructure(
        &self,
        table: &Table,
        change: &TableChange,
    ) -> AdapterResult<()> {
        let mut tables = self.tables.write();
        let data = table_mut(&mut tables, &table.name)?;
        for row in data.rows.values_mut() {
            for column in &change.removed_columns {
                if row.row.get(column).is_some() {
                    let mut kept = Row::new();
                    for (name, value) in row.row.iter().filter(|(n, _)| *n != column) {
                        kept.set(name.clone(), value.clone());
                    }
                    row.row = kept;
                }
            }
        }
        data.definition = table.clone();
        Ok(())
    }

    async fn drop_tracking_infrastructure(&self, schema: &Schema) -> AdapterResult<()> {
        let mut tables = self.tables.write();
        for table in schema.tables() {
            tables.remove(&table.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{people_schema, person};
    use futures::TryStreamExt;
    use rowsync_core::{ApplyFailureKind, Value};

    fn people() -> TableName {
        "people".into()
    }

    fn store() -> MemoryDataStore {
        let store = MemoryDataStore::new().with_unique("people", "email");
        store.provision_now(&people_schema());
        store
    }

    #[tokio::test]
    async fn local_writes_are_selected_in_timestamp_order() {
        let store = store();
        store.upsert(&people(), person(2, "bob")).unwrap();
        store.upsert(&people(), person(1, "ada")).unwrap();
        let checkpoint = store.local_timestamp().await.unwrap();
        store.upsert(&people(), person(3, "cy")).unwrap();

        let all: Vec<TrackedRow> = store
            .select_changes(&people(), None, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let names: Vec<_> = all.iter().map(|r| r.row.get("name").cloned()).collect();
        assert_eq!(
            names,
            vec![
                Some(Value::from("bob")),
                Some(Value::from("ada")),
                Some(Value::from("cy"))
            ]
        );

        let delta: Vec<TrackedRow> = store
            .select_changes(&people(), Some(checkpoint), None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(delta.len(), 1);
    }

    #[tokio::test]
    async fn origin_is_excluded() {
        let store = store();
        let remote = Uuid::new_v4();
        store.upsert(&people(), person(1, "ada")).unwrap();
        store
            .apply_row(
                &people(),
                &TrackedRow::live(person(2, "bob"), 99, Some(remote)),
                None,
            )
            .await
            .unwrap();

        let rows: Vec<TrackedRow> = store
            .select_changes(&people(), None, Some(remote))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metadata.update_scope_id, None);
    }

    #[tokio::test]
    async fn apply_checks_expected_prior() {
        let store = store();
        let ts = store.upsert(&people(), person(1, "ada")).unwrap();
        let incoming = TrackedRow::live(person(1, "eve"), 1, None);

        let outcome = store.apply_row(&people(), &incoming, None).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Conflicted(Some(_))));

        let outcome = store
            .apply_row(&people(), &incoming, Some(ts))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        let stored = store
            .tracked_row(&people(), &RowKey(vec![Value::Integer(1)]))
            .unwrap();
        assert!(stored.metadata.update_timestamp > ts);
    }

    #[tokio::test]
    async fn unique_violation_fails_the_row() {
        let store = store();
        store
            .upsert(&people(), person(1, "ada").with("email", "a@x"))
            .unwrap();
        let outcome = store
            .apply_row(
                &people(),
                &TrackedRow::live(person(2, "bob").with("email", "a@x"), 1, None),
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Failed(ApplyFailure {
                kind: ApplyFailureKind::UniqueKeyConstraint,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn tombstones_and_purge() {
        let store = store();
        store.upsert(&people(), person(1, "ada")).unwrap();
        let key = RowKey(vec![Value::Integer(1)]);
        let deleted_at = store.delete(&people(), &key).unwrap().unwrap();
        assert!(store.rows(&people()).is_empty());
        assert!(store.tracked_row(&people(), &key).unwrap().is_tombstone());

        assert_eq!(
            store
                .purge_tombstones(&people(), deleted_at)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .purge_tombstones(&people(), deleted_at + 1)
                .await
                .unwrap(),
            1
        );
        assert!(store.tracked_rows(&people()).is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = store();
        store.fail_next(1);
        let err = store
            .select_changes(&people(), None, None)
            .await
            .err()
            .unwrap();
        assert!(err.is_transient());
        assert!(store.select_changes(&people(), None, None).await.is_ok());
    }
}
