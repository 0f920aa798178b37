//! Column and table schemas.
//!
//! A [`Schema`] is validated at construction and precomputes the fixed-width
//! row layout used by the row-operations wire encoding: every column owns a
//! fixed-size slot in the row area, with variable-length columns occupying a
//! 16-byte `(offset, length)` slot that points into the indirect data blob.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors returned when assembling a [`Schema`].
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SchemaError {
    #[error("schema must have at least one column")]
    NoColumns,

    #[error("duplicate column name: {name}")]
    DuplicateColumn { name: String },

    #[error("schema must have at least one key column")]
    NoKeyColumns,

    #[error("key columns must be a leading prefix, but {name} is out of place")]
    NonContiguousKey { name: String },

    #[error("key column {name} cannot be nullable")]
    NullableKey { name: String },

    #[error("column {name} has type {data_type} which cannot be part of a key")]
    InvalidKeyType { name: String, data_type: DataType },
}

/// The physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UnixtimeMicros,
    Float,
    Double,
    String,
    Binary,
}

impl DataType {
    /// Size in bytes of this type's slot in the fixed-width row area.
    ///
    /// Variable-length types occupy a 16-byte `(u64 offset, u64 length)`
    /// reference into the indirect data blob.
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float => 4,
            Self::Int64 | Self::UnixtimeMicros | Self::Double => 8,
            Self::String | Self::Binary => 16,
        }
    }

    /// Whether cell payloads of this type live in the indirect data blob.
    pub fn is_var_len(&self) -> bool {
        matches!(self, Self::String | Self::Binary)
    }

    /// Whether a column of this type may participate in the primary key.
    pub fn is_valid_key_type(&self) -> bool {
        !matches!(self, Self::Bool | Self::Float | Self::Double)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UnixtimeMicros => "unixtime_micros",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Schema of a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    name: String,
    data_type: DataType,
    nullable: bool,
    is_key: bool,
}

impl ColumnSchema {
    /// A non-nullable, non-key column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            is_key: false,
        }
    }

    /// Mark this column as part of the primary key.
    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    /// Mark this column as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// The column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The column's physical type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Whether the column accepts NULL.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Whether the column is part of the primary key.
    pub fn is_key(&self) -> bool {
        self.is_key
    }
}

/// A validated table schema.
///
/// Key columns form a leading prefix and are non-nullable. The fixed-width
/// row layout (per-column offsets, total row size) is computed once here and
/// shared by every row buffer and the wire codec.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Arc<[ColumnSchema]>,
    offsets: Arc<[usize]>,
    by_name: Arc<HashMap<String, usize>>,
    num_key_columns: usize,
    row_size: usize,
    has_nullable: bool,
    var_len_columns: usize,
}

impl Schema {
    /// Validate `columns` and build the schema.
    pub fn new(columns: Vec<ColumnSchema>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::NoColumns);
        }

        let mut by_name = HashMap::with_capacity(columns.len());
        let mut offsets = Vec::with_capacity(columns.len());
        let mut num_key_columns = 0;
        let mut row_size = 0;
        let mut has_nullable = false;
        let mut var_len_columns = 0;
        let mut in_key_prefix = true;

        for (idx, col) in columns.iter().enumerate() {
            if by_name.insert(col.name.clone(), idx).is_some() {
                return Err(SchemaError::DuplicateColumn {
                    name: col.name.clone(),
                });
            }

            if col.is_key {
                if !in_key_prefix {
                    return Err(SchemaError::NonContiguousKey {
                        name: col.name.clone(),
                    });
                }
                if col.nullable {
                    return Err(SchemaError::NullableKey {
                        name: col.name.clone(),
                    });
                }
                if !col.data_type.is_valid_key_type() {
                    return Err(SchemaError::InvalidKeyType {
                        name: col.name.clone(),
                        data_type: col.data_type,
                    });
                }
                num_key_columns += 1;
            } else {
                in_key_prefix = false;
            }

            offsets.push(row_size);
            row_size += col.data_type.size();
            has_nullable |= col.nullable;
            var_len_columns += col.data_type.is_var_len() as usize;
        }

        if num_key_columns == 0 {
            return Err(SchemaError::NoKeyColumns);
        }

        Ok(Self {
            columns: columns.into(),
            offsets: offsets.into(),
            by_name: Arc::new(by_name),
            num_key_columns,
            row_size,
            has_nullable,
            var_len_columns,
        })
    }

    /// All columns, in schema order.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// The column at `idx`, if it exists.
    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }

    /// Resolve a column name to its index.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Number of leading primary-key columns.
    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    /// Byte offset of column `idx` in the fixed-width row area.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn column_offset(&self, idx: usize) -> usize {
        self.offsets[idx]
    }

    /// Total width of the fixed row area in bytes.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Whether any column is nullable (and therefore whether encoded rows
    /// carry a nulls bitset).
    pub fn has_nullable_columns(&self) -> bool {
        self.has_nullable
    }

    /// Number of variable-length columns.
    pub fn var_len_columns(&self) -> usize {
        self.var_len_columns
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        // Either the same allocation (the common case, schemas are shared
        // through Arc) or structurally equal columns.
        Arc::ptr_eq(&self.columns, &other.columns) || *self.columns == *other.columns
    }
}

impl Eq for Schema {}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_col(name: &str, t: DataType) -> ColumnSchema {
        ColumnSchema::new(name, t).key()
    }

    #[test]
    fn test_layout() {
        let schema = Schema::new(vec![
            key_col("k1", DataType::Int32),
            key_col("k2", DataType::String),
            ColumnSchema::new("b", DataType::Bool),
            ColumnSchema::new("v", DataType::String).nullable(),
            ColumnSchema::new("d", DataType::Double),
        ])
        .unwrap();

        assert_eq!(schema.num_columns(), 5);
        assert_eq!(schema.num_key_columns(), 2);
        assert_eq!(schema.row_size(), 4 + 16 + 1 + 16 + 8);
        assert_eq!(schema.column_offset(0), 0);
        assert_eq!(schema.column_offset(1), 4);
        assert_eq!(schema.column_offset(2), 20);
        assert_eq!(schema.column_offset(3), 21);
        assert_eq!(schema.column_offset(4), 37);
        assert!(schema.has_nullable_columns());
        assert_eq!(schema.var_len_columns(), 2);
        assert_eq!(schema.column_index("v"), Some(3));
        assert_eq!(schema.column_index("nope"), None);
    }

    #[test]
    fn test_no_nullable_columns() {
        let schema = Schema::new(vec![key_col("k", DataType::Int64)]).unwrap();
        assert!(!schema.has_nullable_columns());
        assert_eq!(schema.var_len_columns(), 0);
    }

    #[test]
    fn test_rejects_invalid() {
        assert_eq!(Schema::new(vec![]).unwrap_err(), SchemaError::NoColumns);

        assert_eq!(
            Schema::new(vec![ColumnSchema::new("v", DataType::Int32)]).unwrap_err(),
            SchemaError::NoKeyColumns
        );

        assert_eq!(
            Schema::new(vec![
                key_col("k", DataType::Int32),
                ColumnSchema::new("k", DataType::Int32),
            ])
            .unwrap_err(),
            SchemaError::DuplicateColumn { name: "k".into() }
        );

        assert_eq!(
            Schema::new(vec![
                key_col("k", DataType::Int32),
                ColumnSchema::new("v", DataType::Int32),
                key_col("k2", DataType::Int32),
            ])
            .unwrap_err(),
            SchemaError::NonContiguousKey { name: "k2".into() }
        );

        assert_eq!(
            Schema::new(vec![key_col("k", DataType::Int32).nullable()]).unwrap_err(),
            SchemaError::NullableKey { name: "k".into() }
        );

        assert_eq!(
            Schema::new(vec![key_col("k", DataType::Double)]).unwrap_err(),
            SchemaError::InvalidKeyType {
                name: "k".into(),
                data_type: DataType::Double
            }
        );
    }

    #[test]
    fn test_type_sizes() {
        assert_eq!(DataType::Bool.size(), 1);
        assert_eq!(DataType::Int8.size(), 1);
        assert_eq!(DataType::Int16.size(), 2);
        assert_eq!(DataType::Int32.size(), 4);
        assert_eq!(DataType::Int64.size(), 8);
        assert_eq!(DataType::UnixtimeMicros.size(), 8);
        assert_eq!(DataType::Float.size(), 4);
        assert_eq!(DataType::Double.size(), 8);
        assert_eq!(DataType::String.size(), 16);
        assert_eq!(DataType::Binary.size(), 16);
    }
}
