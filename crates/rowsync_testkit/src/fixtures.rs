//! Table, schema and row fixtures.

use rowsync_core::{Column, ColumnType, ForeignKey, Row, Schema, Table};

/// `people(id integer pk, name text, email text null)`.
pub fn people_table() -> Table {
    table(
        "people",
        vec![
            Column::new("id", ColumnType::Integer),
            Column::new("name", ColumnType::Text),
            Column::nullable("email", ColumnType::Text),
        ],
    )
}

/// `customers(id integer pk, name text)`.
pub fn customers_table() -> Table {
    table(
        "customers",
        vec![
            Column::new("id", ColumnType::Integer),
            Column::new("name", ColumnType::Text),
        ],
    )
}

/// `orders(id integer pk, customer_id integer -> customers.id, amount integer)`.
pub fn orders_table() -> Table {
    table(
        "orders",
        vec![
            Column::new("id", ColumnType::Integer),
            Column::new("customer_id", ColumnType::Integer),
            Column::new("amount", ColumnType::Integer),
        ],
    )
    .with_foreign_key(ForeignKey::new("customer_id", "customers", "id"))
}

/// Schema holding only [`people_table`].
pub fn people_schema() -> Schema {
    schema(vec![people_table()])
}

/// Schema holding [`orders_table`] and [`customers_table`], declared
/// dependent-first so that ordering tests cannot pass by accident.
pub fn shop_schema() -> Schema {
    schema(vec![orders_table(), customers_table()])
}

/// A `people` row.
pub fn person(id: i64, name: &str) -> Row {
    Row::new().with("id", id).with("name", name)
}

/// A `customers` row.
pub fn customer(id: i64, name: &str) -> Row {
    Row::new().with("id", id).with("name", name)
}

/// An `orders` row.
pub fn order(id: i64, customer_id: i64, amount: i64) -> Row {
    Row::new()
        .with("id", id)
        .with("customer_id", customer_id)
        .with("amount", amount)
}

fn table(name: &str, columns: Vec<Column>) -> Table {
    Table::new(name, columns, vec!["id".to_string()]).expect("fixture table is valid")
}

fn schema(tables: Vec<Table>) -> Schema {
    Schema::new(tables).expect("fixture schema is valid")
}
