//! Tables and write operations.

use std::fmt;
use std::sync::Arc;

use data_types::{PartitionSchema, Schema, TableId};
use row_ops::{encode_partition_key, ChangeType, PartialRow};

/// A table descriptor: everything the write path needs to know about a
/// table. Shared between operations through an `Arc`; the surrounding
/// client keeps it current as the table's tablet mapping changes.
#[derive(Debug)]
pub struct Table {
    id: TableId,
    name: String,
    schema: Schema,
    partition_schema: PartitionSchema,
}

impl Table {
    /// Build a descriptor.
    pub fn new(
        id: TableId,
        name: impl Into<String>,
        schema: Schema,
        partition_schema: PartitionSchema,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            schema,
            partition_schema,
        }
    }

    /// The table id.
    pub fn id(&self) -> &TableId {
        &self.id
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// How rows map to partition keys.
    pub fn partition_schema(&self) -> &PartitionSchema {
        &self.partition_schema
    }
}

/// A single row mutation bound for `table`.
///
/// Assign the row's cells through [`Self::row_mut`], then hand the
/// operation to a session. Applying freezes the row; the copy retained in
/// any resulting [`RowError`](crate::RowError) stays readable but can no
/// longer be changed.
#[derive(Debug, Clone)]
pub struct WriteOperation {
    table: Arc<Table>,
    change_type: ChangeType,
    row: PartialRow,
}

impl WriteOperation {
    fn new(table: Arc<Table>, change_type: ChangeType) -> Self {
        let row = PartialRow::new(table.schema().clone());
        Self {
            table,
            change_type,
            row,
        }
    }

    /// An INSERT; fails on the server if the row already exists.
    pub fn insert(table: Arc<Table>) -> Self {
        Self::new(table, ChangeType::Insert)
    }

    /// An UPDATE of an existing row.
    pub fn update(table: Arc<Table>) -> Self {
        Self::new(table, ChangeType::Update)
    }

    /// An UPSERT: insert, or overwrite if the row exists.
    pub fn upsert(table: Arc<Table>) -> Self {
        Self::new(table, ChangeType::Upsert)
    }

    /// A DELETE of the row with the given primary key.
    pub fn delete(table: Arc<Table>) -> Self {
        Self::new(table, ChangeType::Delete)
    }

    /// The destination table.
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// The kind of change this operation makes.
    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// The row being written.
    pub fn row(&self) -> &PartialRow {
        &self.row
    }

    /// Mutable access to the row. Setters fail once the operation has been
    /// applied to a session.
    pub fn row_mut(&mut self) -> &mut PartialRow {
        &mut self.row
    }

    /// The tablet-routing key for this operation's row.
    pub fn partition_key(&self) -> Result<Vec<u8>, row_ops::partition_key::Error> {
        encode_partition_key(
            self.table.partition_schema(),
            self.table.schema(),
            &self.row,
        )
    }

    pub(crate) fn freeze(&mut self) {
        self.row.freeze();
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.change_type, self.table.name(), self.row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{ColumnSchema, DataType};

    fn table() -> Arc<Table> {
        let schema = Schema::new(vec![
            ColumnSchema::new("key", DataType::Int32).key(),
            ColumnSchema::new("v", DataType::String).nullable(),
        ])
        .unwrap();
        let partition_schema = PartitionSchema::simple_range(&schema);
        Arc::new(Table::new(
            TableId::new("t-0001"),
            "metrics",
            schema,
            partition_schema,
        ))
    }

    #[test]
    fn test_partition_key_requires_key_columns() {
        let op = WriteOperation::insert(table());
        assert!(op.partition_key().is_err());

        let mut op = WriteOperation::insert(table());
        op.row_mut().set_i32("key", 12).unwrap();
        let key = op.partition_key().unwrap();
        assert_eq!(key, ((12_u32) ^ (1 << 31)).to_be_bytes());
    }

    #[test]
    fn test_freeze_stops_mutation() {
        let mut op = WriteOperation::insert(table());
        op.row_mut().set_i32("key", 1).unwrap();
        op.freeze();
        assert!(op.row_mut().set_i32("key", 2).is_err());
        assert!(op.row().is_frozen());
    }

    #[test]
    fn test_display() {
        let mut op = WriteOperation::upsert(table());
        op.row_mut().set_i32("key", 3).unwrap();
        assert_eq!(op.to_string(), "Upsert metrics (int32 key=3)");
    }
}
