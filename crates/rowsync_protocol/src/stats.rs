//! Per-table application statistics and row failures.

use crate::conflict::ConflictType;
use rowsync_core::{RowKey, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row counts for one table in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Rows written without a conflict.
    pub applied: u64,
    /// True conflicts resolved (remote, local or merged row written).
    pub resolved_conflicts: u64,
    /// True conflicts left unresolved.
    pub unresolved_conflicts: u64,
    /// Rows rejected by the store or the adapter.
    pub failed: u64,
}

impl TableStats {
    /// Returns the number of rows that did not end up written.
    pub fn not_applied(&self) -> u64 {
        self.unresolved_conflicts + self.failed
    }

    /// Returns the number of rows written, conflicts included.
    pub fn written(&self) -> u64 {
        self.applied + self.resolved_conflicts
    }

    /// Adds `other` to these counts.
    pub fn merge(&mut self, other: &TableStats) {
        self.applied += other.applied;
        self.resolved_conflicts += other.resolved_conflicts;
        self.unresolved_conflicts += other.unresolved_conflicts;
        self.failed += other.failed;
    }
}

/// Statistics of one direction (upload or download), keyed by table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    /// Counts per table.
    pub tables: BTreeMap<TableName, TableStats>,
}

impl ApplyStats {
    /// Returns the mutable counts of `table`, creating them if needed.
    pub fn table_mut(&mut self, table: &TableName) -> &mut TableStats {
        self.tables.entry(table.clone()).or_default()
    }

    /// Returns the counts of `table`.
    pub fn table(&self, table: &TableName) -> TableStats {
        self.tables.get(table).copied().unwrap_or_default()
    }

    /// Returns the counts summed over all tables.
    pub fn total(&self) -> TableStats {
        let mut total = TableStats::default();
        for stats in self.tables.values() {
            total.merge(stats);
        }
        total
    }

    /// Adds `other` to these counts.
    pub fn merge(&mut self, other: &ApplyStats) {
        for (table, stats) in &other.tables {
            self.table_mut(table).merge(stats);
        }
    }
}

/// A row that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    /// Table of the row.
    pub table: TableName,
    /// Key of the row.
    pub key: RowKey,
    /// [`ConflictType::UniqueKeyConstraint`] or
    /// [`ConflictType::ErrorsOccurred`].
    pub conflict_type: ConflictType,
    /// Store or adapter message.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_merge_tables() {
        let mut stats = ApplyStats::default();
        stats.table_mut(&"a".into()).applied = 3;
        stats.table_mut(&"b".into()).failed = 1;
        stats.table_mut(&"b".into()).resolved_conflicts = 2;

        let total = stats.total();
        assert_eq!(total.applied, 3);
        assert_eq!(total.written(), 5);
        assert_eq!(total.not_applied(), 1);

        let mut other = ApplyStats::default();
        other.table_mut(&"a".into()).applied = 1;
        stats.merge(&other);
        assert_eq!(stats.table(&"a".into()).applied, 4);
        assert_eq!(stats.table(&"missing".into()), TableStats::default());
    }
}
