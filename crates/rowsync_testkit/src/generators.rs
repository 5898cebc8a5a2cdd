//! Property-based test generators using proptest.
//!
//! Provides strategies for generating rows that satisfy their table
//! definition.

use proptest::prelude::*;
use rowsync_core::{ColumnType, Row, Table, TrackedRow, Value};
use std::ops::Range;

/// Strategy for a non-null value of `column_type`.
pub fn value_strategy(column_type: ColumnType) -> BoxedStrategy<Value> {
    match column_type {
        ColumnType::Boolean => any::<bool>().prop_map(Value::Bool).boxed(),
        ColumnType::Integer => any::<i64>().prop_map(Value::Integer).boxed(),
        ColumnType::Text => "[a-zA-Z0-9 ]{0,24}".prop_map(Value::Text).boxed(),
        ColumnType::Bytes => prop::collection::vec(any::<u8>(), 0..32)
            .prop_map(Value::Bytes)
            .boxed(),
    }
}

/// Strategy for a row valid against `table`. Nullable columns are
/// sometimes left unset.
pub fn row_strategy(table: Table) -> BoxedStrategy<Row> {
    let columns: Vec<BoxedStrategy<(String, Option<Value>)>> = table
        .columns
        .iter()
        .map(|column| {
            let name = column.name.clone();
            let value = value_strategy(column.column_type);
            if column.nullable {
                prop::option::of(value)
                    .prop_map(move |v| (name.clone(), v))
                    .boxed()
            } else {
                value.prop_map(move |v| (name.clone(), Some(v))).boxed()
            }
        })
        .collect();

    columns
        .prop_map(|cells| {
            let mut row = Row::new();
            for (name, value) in cells {
                if let Some(value) = value {
                    row.set(name, value);
                }
            }
            row
        })
        .boxed()
}

/// Strategy for a changeset of `table` with distinct keys and strictly
/// increasing timestamps. Some rows are tombstones.
///
/// Integer and text key columns are overwritten with the row's position so
/// that keys never collide.
pub fn tracked_rows_strategy(table: Table, size: Range<usize>) -> BoxedStrategy<Vec<TrackedRow>> {
    let key_columns: Vec<(String, ColumnType)> = table
        .key_columns()
        .map(|c| (c.name.clone(), c.column_type))
        .collect();

    prop::collection::vec((row_strategy(table), any::<bool>()), size)
        .prop_map(move |rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (mut row, tombstone))| {
                    for (name, column_type) in &key_columns {
                        match column_type {
                            ColumnType::Integer => row.set(name.clone(), i as i64),
                            ColumnType::Text => row.set(name.clone(), format!("k{i}")),
                            ColumnType::Bytes => {
                                row.set(name.clone(), (i as u64).to_be_bytes().to_vec())
                            }
                            ColumnType::Boolean => {}
                        }
                    }
                    let timestamp = i as u64 + 1;
                    if tombstone {
                        TrackedRow::tombstone(row, timestamp, None)
                    } else {
                        TrackedRow::live(row, timestamp, None)
                    }
                })
                .collect()
        })
        .boxed()
}
