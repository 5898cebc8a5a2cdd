//! Row values and per-row tracking metadata.

use crate::error::{CoreError, CoreResult};
use crate::schema::{ColumnType, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A single cell value.
///
/// Floats are intentionally not supported so that values (and therefore
/// primary keys) are totally ordered and hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// SQL null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if the value can be stored in a column of `column_type`.
    /// Null matches every type; nullability is checked separately.
    pub fn matches(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::Bool(_), ColumnType::Boolean)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Bytes(_), ColumnType::Bytes)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Primary-key values of a row, in key-column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub Vec<Value>);

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

/// A row: column name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a column and returns the row.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Sets a column.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// Gets a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Iterates over columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Returns the number of columns set.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no column is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Extracts the primary key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRow`] if a key column is missing or null.
    pub fn key(&self, table: &Table) -> CoreResult<RowKey> {
        table
            .primary_key
            .iter()
            .map(|k| match self.values.get(k) {
                Some(v) if !v.is_null() => Ok(v.clone()),
                _ => Err(CoreError::invalid_row(
                    table.name.to_string(),
                    format!("missing primary key column {k}"),
                )),
            })
            .collect::<CoreResult<Vec<_>>>()
            .map(RowKey)
    }

    /// Returns a row holding only the primary-key columns.
    pub fn key_only(&self, table: &Table) -> Row {
        Row {
            values: self
                .values
                .iter()
                .filter(|(k, _)| table.is_key_column(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Builds a row from a key.
    pub fn from_key(table: &Table, key: &RowKey) -> Row {
        Row {
            values: table
                .primary_key
                .iter()
                .cloned()
                .zip(key.0.iter().cloned())
                .collect(),
        }
    }

    /// Checks the row against its table definition, the same way an
    /// adapter checks an ordinary write.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRow`] if the row has an unknown column,
    /// a null in a non-nullable column, a type mismatch, or no key.
    pub fn validate(&self, table: &Table) -> CoreResult<()> {
        for (name, value) in &self.values {
            let Some(column) = table.column(name) else {
                return Err(CoreError::invalid_row(
                    table.name.to_string(),
                    format!("unknown column {name}"),
                ));
            };
            if !value.matches(column.column_type) {
                return Err(CoreError::invalid_row(
                    table.name.to_string(),
                    format!("column {name} expects {:?}", column.column_type),
                ));
            }
        }
        for column in &table.columns {
            let missing = self.values.get(&column.name).map_or(true, Value::is_null);
            if missing && !column.nullable {
                return Err(CoreError::invalid_row(
                    table.name.to_string(),
                    format!("column {} is not nullable", column.name),
                ));
            }
        }
        self.key(table).map(|_| ())
    }
}

/// Tracking metadata kept beside every synchronized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingMetadata {
    /// Logical clock value assigned at write time.
    pub update_timestamp: u64,
    /// Participant that caused the write; `None` for local writes.
    pub update_scope_id: Option<Uuid>,
    /// Whether the row has been deleted.
    pub is_tombstone: bool,
}

impl TrackingMetadata {
    /// Returns true if the row was written after `since` (always true when
    /// there is no checkpoint yet).
    pub fn changed_since(&self, since: Option<u64>) -> bool {
        since.map_or(true, |s| self.update_timestamp > s)
    }

    /// Returns true if the last write came from participant `id`.
    pub fn written_by(&self, id: Uuid) -> bool {
        self.update_scope_id == Some(id)
    }
}

/// A row together with its tracking metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRow {
    /// Row values. Tombstones carry at least the key columns.
    pub row: Row,
    /// Tracking metadata.
    pub metadata: TrackingMetadata,
}

impl TrackedRow {
    /// Creates a live row.
    pub fn live(row: Row, update_timestamp: u64, update_scope_id: Option<Uuid>) -> Self {
        Self {
            row,
            metadata: TrackingMetadata {
                update_timestamp,
                update_scope_id,
                is_tombstone: false,
            },
        }
    }

    /// Creates a tombstone.
    pub fn tombstone(row: Row, update_timestamp: u64, update_scope_id: Option<Uuid>) -> Self {
        Self {
            row,
            metadata: TrackingMetadata {
                update_timestamp,
                update_scope_id,
                is_tombstone: true,
            },
        }
    }

    /// Returns true if this row is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.metadata.is_tombstone
    }

    /// Extracts the primary key.
    pub fn key(&self, table: &Table) -> CoreResult<RowKey> {
        self.row.key(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    fn people() -> Table {
        Table::new(
            "people",
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("name", ColumnType::Text),
                Column::nullable("email", ColumnType::Text),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    #[test]
    fn key_extraction() {
        let row = Row::new().with("id", 7).with("name", "ada");
        assert_eq!(row.key(&people()).unwrap(), RowKey(vec![Value::Integer(7)]));

        let row = Row::new().with("name", "ada");
        assert!(row.key(&people()).is_err());
    }

    #[test]
    fn validation() {
        let table = people();
        assert!(Row::new()
            .with("id", 1)
            .with("name", "ada")
            .validate(&table)
            .is_ok());

        // non-nullable column missing
        assert!(Row::new().with("id", 1).validate(&table).is_err());
        // type mismatch
        assert!(Row::new()
            .with("id", 1)
            .with("name", 5)
            .validate(&table)
            .is_err());
        // unknown column
        assert!(Row::new()
            .with("id", 1)
            .with("name", "ada")
            .with("age", 3)
            .validate(&table)
            .is_err());
    }

    #[test]
    fn key_only_and_from_key() {
        let table = people();
        let row = Row::new().with("id", 3).with("name", "x");
        let key_row = row.key_only(&table);
        assert_eq!(key_row.len(), 1);
        assert_eq!(Row::from_key(&table, &row.key(&table).unwrap()), key_row);
    }

    #[test]
    fn changed_since() {
        let meta = TrackingMetadata {
            update_timestamp: 5,
            update_scope_id: None,
            is_tombstone: false,
        };
        assert!(meta.changed_since(None));
        assert!(meta.changed_since(Some(4)));
        assert!(!meta.changed_since(Some(5)));
    }

    #[test]
    fn key_display() {
        let key = RowKey(vec![Value::Integer(1), Value::from("a")]);
        assert_eq!(key.to_string(), "(1, \"a\")");
    }
}
