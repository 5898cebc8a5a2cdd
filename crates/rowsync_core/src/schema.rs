//! Logical schema model: tables, columns, keys and their dependency order.
//!
//! The schema model is the foundation every other component builds on. It
//! describes *what* is synchronized without knowing anything about a
//! backend's SQL dialect.
//!
//! ## Invariants
//!
//! - Primary-key columns exist in the column list and are non-nullable
//! - Primary keys are immutable: a diff that changes them is
//!   [`CoreError::SchemaIncompatible`]
//! - Tables compare equal when name, namespace and columns match

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A table name with an optional namespace (SQL schema).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// Namespace the table lives in, if any.
    pub namespace: Option<String>,
    /// Table name.
    pub name: String,
}

impl TableName {
    /// Creates an unqualified table name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Creates a namespace-qualified table name.
    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&str> for TableName {
    fn from(name: &str) -> Self {
        TableName::new(name)
    }
}

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Boolean.
    Boolean,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub column_type: ColumnType,
    /// Whether the column accepts nulls.
    pub nullable: bool,
}

impl Column {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    /// Creates a nullable column.
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// A foreign key from one table to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing columns in the owning table.
    pub columns: Vec<String>,
    /// The referenced table.
    pub referenced_table: TableName,
    /// Referenced columns, positionally matching `columns`.
    pub referenced_columns: Vec<String>,
}

impl ForeignKey {
    /// Creates a single-column foreign key.
    pub fn new(
        column: impl Into<String>,
        referenced_table: impl Into<TableName>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            columns: vec![column.into()],
            referenced_table: referenced_table.into(),
            referenced_columns: vec![referenced_column.into()],
        }
    }
}

/// Which way a table's changes flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Changes flow both ways.
    #[default]
    Bidirectional,
    /// Client changes are uploaded; server changes are never downloaded.
    UploadOnly,
    /// Server changes are downloaded; client changes are never uploaded.
    DownloadOnly,
}

impl SyncDirection {
    /// Returns true if client changes are uploaded.
    pub fn uploads(&self) -> bool {
        !matches!(self, SyncDirection::DownloadOnly)
    }

    /// Returns true if server changes are downloaded.
    pub fn downloads(&self) -> bool {
        !matches!(self, SyncDirection::UploadOnly)
    }
}

/// A synchronized table definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: TableName,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    /// Primary-key column names.
    pub primary_key: Vec<String>,
    /// Declared foreign keys.
    pub foreign_keys: Vec<ForeignKey>,
    /// Sync direction.
    pub direction: SyncDirection,
}

impl Table {
    /// Creates a table, validating its primary key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSchema`] if:
    /// - the primary key is empty
    /// - a key column is missing from the column list or is nullable
    /// - a column name appears twice
    pub fn new(
        name: impl Into<TableName>,
        columns: Vec<Column>,
        primary_key: Vec<String>,
    ) -> CoreResult<Self> {
        let name = name.into();

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "duplicate column {} in table {}",
                    column.name, name
                )));
            }
        }

        if primary_key.is_empty() {
            return Err(CoreError::invalid_schema(format!(
                "table {name} has no primary key"
            )));
        }

        for key in &primary_key {
            match columns.iter().find(|c| &c.name == key) {
                None => {
                    return Err(CoreError::invalid_schema(format!(
                        "primary key column {key} missing from table {name}"
                    )))
                }
                Some(c) if c.nullable => {
                    return Err(CoreError::invalid_schema(format!(
                        "primary key column {key} of table {name} is nullable"
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            name,
            columns,
            primary_key,
            foreign_keys: Vec::new(),
            direction: SyncDirection::default(),
        })
    }

    /// Adds a foreign key.
    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Sets the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns true if `name` is part of the primary key.
    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Returns the key columns in key order.
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.primary_key.iter().filter_map(|k| self.column(k))
    }

    fn referenced_tables(&self) -> impl Iterator<Item = &TableName> {
        self.foreign_keys
            .iter()
            .map(|fk| &fk.referenced_table)
            .filter(move |t| **t != self.name)
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.columns == other.columns
    }
}

impl Eq for Table {}

/// What to do when foreign keys form a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CyclePolicy {
    /// Fail with [`CoreError::SchemaCycle`].
    #[default]
    Fail,
    /// Order everything outside the cycle, then append the cyclic tables
    /// in declaration order.
    AppendInDeclarationOrder,
}

/// An ordered set of table definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    tables: Vec<Table>,
}

impl Schema {
    /// Creates a schema.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSchema`] if two tables share a name or a
    /// foreign key references a column its table does not have.
    pub fn new(tables: Vec<Table>) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        for table in &tables {
            if !seen.insert(&table.name) {
                return Err(CoreError::invalid_schema(format!(
                    "duplicate table {}",
                    table.name
                )));
            }
            for fk in &table.foreign_keys {
                if fk.columns.len() != fk.referenced_columns.len() {
                    return Err(CoreError::invalid_schema(format!(
                        "foreign key on {} has mismatched column counts",
                        table.name
                    )));
                }
                if let Some(missing) = fk.columns.iter().find(|c| table.column(c).is_none()) {
                    return Err(CoreError::invalid_schema(format!(
                        "foreign key column {} missing from table {}",
                        missing, table.name
                    )));
                }
            }
        }
        Ok(Self { tables })
    }

    /// Returns the tables in declaration order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Looks up a table.
    pub fn table(&self, name: &TableName) -> Option<&Table> {
        self.tables.iter().find(|t| &t.name == name)
    }

    /// Returns true if the schema has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Orders tables so that referenced tables come before the tables that
    /// reference them.
    ///
    /// Ties are broken by declaration order, so the result is stable.
    /// References to tables outside the schema and self-references are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaCycle`] when the foreign keys form a cycle
    /// and `policy` is [`CyclePolicy::Fail`].
    pub fn dependency_order(&self, policy: CyclePolicy) -> CoreResult<Vec<TableName>> {
        let mut placed: Vec<TableName> = Vec::with_capacity(self.tables.len());
        let mut remaining: Vec<&Table> = self.tables.iter().collect();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|table| {
                table
                    .referenced_tables()
                    .filter(|dep| self.table(dep).is_some())
                    .all(|dep| placed.contains(dep))
            });

            match ready {
                Some(idx) => placed.push(remaining.remove(idx).name.clone()),
                None => match policy {
                    CyclePolicy::Fail => {
                        return Err(CoreError::SchemaCycle {
                            tables: cycle_members(&remaining),
                        })
                    }
                    CyclePolicy::AppendInDeclarationOrder => {
                        placed.extend(remaining.drain(..).map(|t| t.name.clone()));
                    }
                },
            }
        }

        Ok(placed)
    }

    /// Computes the changes needed to move from `self` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaIncompatible`] if a table present in both
    /// schemas changed its primary key or the type of a key column.
    pub fn diff(&self, target: &Schema) -> CoreResult<SchemaDiff> {
        let mut diff = SchemaDiff::default();

        for new_table in &target.tables {
            let Some(old_table) = self.table(&new_table.name) else {
                diff.added.push(new_table.clone());
                continue;
            };

            if old_table.primary_key != new_table.primary_key {
                return Err(CoreError::schema_incompatible(
                    new_table.name.to_string(),
                    format!(
                        "primary key changed from {:?} to {:?}",
                        old_table.primary_key, new_table.primary_key
                    ),
                ));
            }
            for key in &new_table.primary_key {
                if old_table.column(key) != new_table.column(key) {
                    return Err(CoreError::schema_incompatible(
                        new_table.name.to_string(),
                        format!("primary key column {key} changed definition"),
                    ));
                }
            }

            let change = TableChange {
                table: new_table.name.clone(),
                added_columns: new_table
                    .columns
                    .iter()
                    .filter(|c| old_table.column(&c.name).is_none())
                    .cloned()
                    .collect(),
                removed_columns: old_table
                    .columns
                    .iter()
                    .filter(|c| new_table.column(&c.name).is_none())
                    .map(|c| c.name.clone())
                    .collect(),
                retyped_columns: new_table
                    .columns
                    .iter()
                    .filter(|c| matches!(old_table.column(&c.name), Some(old) if old != *c))
                    .cloned()
                    .collect(),
            };
            if !change.is_empty() {
                diff.altered.push(change);
            }
        }

        diff.removed = self
            .tables
            .iter()
            .filter(|t| target.table(&t.name).is_none())
            .cloned()
            .collect();

        Ok(diff)
    }
}

/// Names of the tables in `remaining` that reach themselves through foreign
/// keys, leaving out tables that only depend on a cycle.
fn cycle_members(remaining: &[&Table]) -> Vec<String> {
    fn edges(remaining: &[&Table], table: &Table) -> Vec<usize> {
        table
            .referenced_tables()
            .filter_map(|dep| remaining.iter().position(|t| &t.name == dep))
            .collect()
    }

    remaining
        .iter()
        .enumerate()
        .filter(|&(start, table)| {
            let mut seen = vec![false; remaining.len()];
            let mut stack = edges(remaining, table);
            while let Some(idx) = stack.pop() {
                if idx == start {
                    return true;
                }
                if !std::mem::replace(&mut seen[idx], true) {
                    stack.extend(edges(remaining, remaining[idx]));
                }
            }
            false
        })
        .map(|(_, table)| table.name.to_string())
        .collect()
}

/// Column-level changes to one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    /// The altered table.
    pub table: TableName,
    /// Columns that did not exist before.
    pub added_columns: Vec<Column>,
    /// Names of columns that no longer exist.
    pub removed_columns: Vec<String>,
    /// Columns whose type or nullability changed.
    pub retyped_columns: Vec<Column>,
}

impl TableChange {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.retyped_columns.is_empty()
    }
}

/// Difference between two schemas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Tables only in the target schema.
    pub added: Vec<Table>,
    /// Tables only in the source schema.
    pub removed: Vec<Table>,
    /// Tables present in both with column changes.
    pub altered: Vec<TableChange>,
}

impl SchemaDiff {
    /// Returns true if the schemas are structurally identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.altered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> Table {
        Table::new(
            name,
            vec![
                Column::new("id", ColumnType::Integer),
                Column::nullable("name", ColumnType::Text),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    #[test]
    fn primary_key_must_be_non_nullable() {
        let err = Table::new(
            "t",
            vec![Column::nullable("id", ColumnType::Integer)],
            vec!["id".into()],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSchema { .. }));
    }

    #[test]
    fn primary_key_must_exist() {
        let err = Table::new(
            "t",
            vec![Column::new("id", ColumnType::Integer)],
            vec!["missing".into()],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSchema { .. }));

        let err = Table::new("t", vec![Column::new("id", ColumnType::Integer)], vec![]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSchema { .. }));
    }

    #[test]
    fn structural_equality_ignores_foreign_keys() {
        let a = table("orders");
        let b = table("orders").with_foreign_key(ForeignKey::new("id", "customers", "id"));
        assert_eq!(a, b);

        let c = Table::new(
            TableName::qualified("sales", "orders"),
            a.columns.clone(),
            vec!["id".into()],
        )
        .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn dependency_order_puts_referenced_tables_first() {
        let lines = table("lines").with_foreign_key(ForeignKey::new("id", "orders", "id"));
        let orders = table("orders").with_foreign_key(ForeignKey::new("id", "customers", "id"));
        let customers = table("customers");
        let schema = Schema::new(vec![lines, orders, customers]).unwrap();

        let order = schema.dependency_order(CyclePolicy::Fail).unwrap();
        assert_eq!(
            order,
            vec![
                TableName::new("customers"),
                TableName::new("orders"),
                TableName::new("lines")
            ]
        );
    }

    #[test]
    fn dependency_order_is_stable_and_ignores_self_references() {
        let a = table("a").with_foreign_key(ForeignKey::new("id", "a", "id"));
        let b = table("b");
        let schema = Schema::new(vec![a, b]).unwrap();
        let order = schema.dependency_order(CyclePolicy::Fail).unwrap();
        assert_eq!(order, vec![TableName::new("a"), TableName::new("b")]);
    }

    #[test]
    fn dependency_cycle_fails_fast() {
        let a = table("a").with_foreign_key(ForeignKey::new("id", "b", "id"));
        let b = table("b").with_foreign_key(ForeignKey::new("id", "a", "id"));
        let c = table("c");
        let schema = Schema::new(vec![a, b, c]).unwrap();

        let err = schema.dependency_order(CyclePolicy::Fail).unwrap_err();
        match err {
            CoreError::SchemaCycle { tables } => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }

        let order = schema
            .dependency_order(CyclePolicy::AppendInDeclarationOrder)
            .unwrap();
        assert_eq!(
            order,
            vec![TableName::new("c"), TableName::new("a"), TableName::new("b")]
        );
    }

    #[test]
    fn dependency_cycle_names_only_cyclic_tables() {
        let a = table("a").with_foreign_key(ForeignKey::new("id", "b", "id"));
        let b = table("b").with_foreign_key(ForeignKey::new("id", "a", "id"));
        let child = table("child").with_foreign_key(ForeignKey::new("id", "a", "id"));
        let schema = Schema::new(vec![child, a, b]).unwrap();

        match schema.dependency_order(CyclePolicy::Fail).unwrap_err() {
            CoreError::SchemaCycle { tables } => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn diff_reports_retyped_columns() {
        let old = Schema::new(vec![table("a")]).unwrap();
        let mut retyped = table("a");
        retyped.columns[1] = Column::new("name", ColumnType::Text);
        let new = Schema::new(vec![retyped]).unwrap();

        let diff = old.diff(&new).unwrap();
        assert_eq!(diff.altered.len(), 1);
        let change = &diff.altered[0];
        assert_eq!(change.table, TableName::new("a"));
        assert!(change.added_columns.is_empty());
        assert_eq!(change.retyped_columns, vec![Column::new("name", ColumnType::Text)]);
    }

    #[test]
    fn diff_detects_added_removed_and_altered() {
        let old = Schema::new(vec![table("a"), table("b")]).unwrap();
        let mut altered_b = table("b");
        altered_b
            .columns
            .push(Column::nullable("email", ColumnType::Text));
        let new = Schema::new(vec![altered_b, table("c")]).unwrap();

        let diff = old.diff(&new).unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, TableName::new("c"));
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].name, TableName::new("a"));
        assert_eq!(diff.altered.len(), 1);
        assert_eq!(diff.altered[0].added_columns[0].name, "email");

        assert!(new.diff(&new).unwrap().is_empty());
    }

    #[test]
    fn diff_rejects_primary_key_change() {
        let old = Schema::new(vec![table("a")]).unwrap();
        let changed = Table::new(
            "a",
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("name", ColumnType::Text),
            ],
            vec!["name".into()],
        )
        .unwrap();
        let new = Schema::new(vec![changed]).unwrap();

        assert!(matches!(
            old.diff(&new),
            Err(CoreError::SchemaIncompatible { .. })
        ));
    }

    #[test]
    fn direction_flags() {
        assert!(SyncDirection::Bidirectional.uploads());
        assert!(SyncDirection::Bidirectional.downloads());
        assert!(!SyncDirection::DownloadOnly.uploads());
        assert!(!SyncDirection::UploadOnly.downloads());
    }
}
