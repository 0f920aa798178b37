//! A partially-specified row.

use std::fmt;

use bytes::Bytes;
use data_types::{DataType, Schema};
use snafu::{ensure, Snafu};

use crate::bitset::BitSet;

/// Errors returned by [`PartialRow`] mutators. These are programmer errors;
/// nothing about the row changes when a mutator fails.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("row is frozen and can no longer be mutated"))]
    Frozen,

    #[snafu(display("unknown column: {name}"))]
    UnknownColumn { name: String },

    #[snafu(display("wrong type for column {name} ({expected}): got {given}"))]
    TypeMismatch {
        name: String,
        expected: DataType,
        given: DataType,
    },

    #[snafu(display("column {name} is not nullable"))]
    NotNullable { name: String },
}

/// A specialized `Error` for row mutation errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The set of column values explicitly assigned for one row mutation.
///
/// Tracks one "set" bit per column and one "null" bit per column, a
/// fixed-width buffer holding the assigned fixed-size cells at their schema
/// offsets, and per-column side buffers for variable-length cells.
///
/// Once the owning operation has been submitted to a session the row is
/// *frozen*: every mutator fails with [`Error::Frozen`] from then on.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRow {
    schema: Schema,
    set_bits: BitSet,
    null_bits: BitSet,
    row_data: Vec<u8>,
    var_len: Vec<Bytes>,
    frozen: bool,
}

impl PartialRow {
    /// An empty row for `schema` with no columns set.
    pub fn new(schema: Schema) -> Self {
        let num_columns = schema.num_columns();
        let row_size = schema.row_size();
        Self {
            schema,
            set_bits: BitSet::with_size(num_columns),
            null_bits: BitSet::with_size(num_columns),
            row_data: vec![0; row_size],
            var_len: vec![Bytes::new(); num_columns],
            frozen: false,
        }
    }

    /// The schema this row belongs to.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Marks the row read-only. Irreversible.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the row has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Whether column `idx` has been assigned (including assigned to NULL).
    pub fn is_set(&self, idx: usize) -> bool {
        self.set_bits.get(idx)
    }

    /// Whether column `idx` has been assigned NULL.
    pub fn is_null(&self, idx: usize) -> bool {
        self.null_bits.get(idx)
    }

    /// Whether every primary-key column is set and non-NULL.
    pub fn is_key_set(&self) -> bool {
        (0..self.schema.num_key_columns()).all(|idx| self.is_set(idx) && !self.is_null(idx))
    }

    /// The columns-set bitset, one bit per column in schema order.
    pub fn set_bits(&self) -> &BitSet {
        &self.set_bits
    }

    /// The nulls bitset, one bit per column in schema order.
    pub fn null_bits(&self) -> &BitSet {
        &self.null_bits
    }

    /// The fixed-size cell bytes of column `idx` (little-endian), at most
    /// meaningful when the column is set, non-NULL, and not variable-length.
    pub fn fixed_cell(&self, idx: usize) -> &[u8] {
        let offset = self.schema.column_offset(idx);
        let size = self.schema.columns()[idx].data_type().size();
        &self.row_data[offset..offset + size]
    }

    /// The variable-length cell payload of column `idx`.
    pub fn var_len_cell(&self, idx: usize) -> &Bytes {
        &self.var_len[idx]
    }

    /// Set a boolean column.
    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.set_fixed(name, DataType::Bool, &[value as u8])
    }

    /// Set an 8-bit integer column.
    pub fn set_i8(&mut self, name: &str, value: i8) -> Result<()> {
        self.set_fixed(name, DataType::Int8, &value.to_le_bytes())
    }

    /// Set a 16-bit integer column.
    pub fn set_i16(&mut self, name: &str, value: i16) -> Result<()> {
        self.set_fixed(name, DataType::Int16, &value.to_le_bytes())
    }

    /// Set a 32-bit integer column.
    pub fn set_i32(&mut self, name: &str, value: i32) -> Result<()> {
        self.set_fixed(name, DataType::Int32, &value.to_le_bytes())
    }

    /// Set a 64-bit integer column.
    pub fn set_i64(&mut self, name: &str, value: i64) -> Result<()> {
        self.set_fixed(name, DataType::Int64, &value.to_le_bytes())
    }

    /// Set a timestamp column, in microseconds since the unix epoch.
    pub fn set_unixtime_micros(&mut self, name: &str, value: i64) -> Result<()> {
        self.set_fixed(name, DataType::UnixtimeMicros, &value.to_le_bytes())
    }

    /// Set a 32-bit float column.
    pub fn set_f32(&mut self, name: &str, value: f32) -> Result<()> {
        self.set_fixed(name, DataType::Float, &value.to_le_bytes())
    }

    /// Set a 64-bit float column.
    pub fn set_f64(&mut self, name: &str, value: f64) -> Result<()> {
        self.set_fixed(name, DataType::Double, &value.to_le_bytes())
    }

    /// Set a string column.
    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.set_var_len(name, DataType::String, Bytes::from(value.into()))
    }

    /// Set a binary column.
    pub fn set_binary(&mut self, name: &str, value: impl Into<Bytes>) -> Result<()> {
        self.set_var_len(name, DataType::Binary, value.into())
    }

    /// Set a nullable column to NULL.
    pub fn set_null(&mut self, name: &str) -> Result<()> {
        ensure!(!self.frozen, FrozenSnafu);
        let idx = self.column_index(name)?;
        let col = &self.schema.columns()[idx];
        ensure!(
            col.is_nullable(),
            NotNullableSnafu {
                name: col.name().to_owned()
            }
        );
        self.set_bits.set(idx);
        self.null_bits.set(idx);
        self.var_len[idx] = Bytes::new();
        Ok(())
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.schema
            .column_index(name)
            .ok_or_else(|| Error::UnknownColumn {
                name: name.to_owned(),
            })
    }

    fn checked_index(&self, name: &str, given: DataType) -> Result<usize> {
        ensure!(!self.frozen, FrozenSnafu);
        let idx = self.column_index(name)?;
        let col = &self.schema.columns()[idx];
        ensure!(
            col.data_type() == given,
            TypeMismatchSnafu {
                name: col.name().to_owned(),
                expected: col.data_type(),
                given,
            }
        );
        Ok(idx)
    }

    fn set_fixed(&mut self, name: &str, given: DataType, cell: &[u8]) -> Result<()> {
        let idx = self.checked_index(name, given)?;
        let offset = self.schema.column_offset(idx);
        self.row_data[offset..offset + cell.len()].copy_from_slice(cell);
        self.set_bits.set(idx);
        self.null_bits.unset(idx);
        Ok(())
    }

    fn set_var_len(&mut self, name: &str, given: DataType, cell: Bytes) -> Result<()> {
        let idx = self.checked_index(name, given)?;
        self.var_len[idx] = cell;
        self.set_bits.set(idx);
        self.null_bits.unset(idx);
        Ok(())
    }
}

impl fmt::Display for PartialRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for (idx, col) in self.schema.columns().iter().enumerate() {
            if !self.is_set(idx) {
                continue;
            }
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{} {}=", col.data_type(), col.name())?;
            if self.is_null(idx) {
                write!(f, "NULL")?;
                continue;
            }
            match col.data_type() {
                DataType::Bool => write!(f, "{}", self.fixed_cell(idx)[0] != 0)?,
                DataType::Int8 => write!(f, "{}", self.fixed_cell(idx)[0] as i8)?,
                DataType::Int16 => {
                    let v = i16::from_le_bytes(self.fixed_cell(idx).try_into().unwrap());
                    write!(f, "{v}")?
                }
                DataType::Int32 => {
                    let v = i32::from_le_bytes(self.fixed_cell(idx).try_into().unwrap());
                    write!(f, "{v}")?
                }
                DataType::Int64 | DataType::UnixtimeMicros => {
                    let v = i64::from_le_bytes(self.fixed_cell(idx).try_into().unwrap());
                    write!(f, "{v}")?
                }
                DataType::Float => {
                    let v = f32::from_le_bytes(self.fixed_cell(idx).try_into().unwrap());
                    write!(f, "{v}")?
                }
                DataType::Double => {
                    let v = f64::from_le_bytes(self.fixed_cell(idx).try_into().unwrap());
                    write!(f, "{v}")?
                }
                DataType::String => write!(
                    f,
                    "{:?}",
                    String::from_utf8_lossy(self.var_len_cell(idx))
                )?,
                DataType::Binary => write!(f, "{:?}", &self.var_len_cell(idx)[..])?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::ColumnSchema;

    fn test_schema() -> Schema {
        Schema::new(vec![
            ColumnSchema::new("key", DataType::Int32).key(),
            ColumnSchema::new("name", DataType::String).nullable(),
            ColumnSchema::new("score", DataType::Double),
        ])
        .unwrap()
    }

    #[test]
    fn test_set_and_inspect() {
        let mut row = PartialRow::new(test_schema());
        assert!(!row.is_key_set());

        row.set_i32("key", 42).unwrap();
        row.set_string("name", "abc").unwrap();

        assert!(row.is_key_set());
        assert!(row.is_set(0));
        assert!(row.is_set(1));
        assert!(!row.is_set(2));
        assert!(!row.is_null(1));
        assert_eq!(row.fixed_cell(0), 42_i32.to_le_bytes());
        assert_eq!(&row.var_len_cell(1)[..], b"abc");
        assert_eq!(row.to_string(), r#"(int32 key=42, string name="abc")"#);
    }

    #[test]
    fn test_set_null() {
        let mut row = PartialRow::new(test_schema());
        row.set_null("name").unwrap();
        assert!(row.is_set(1));
        assert!(row.is_null(1));

        // Nulling then re-assigning clears the null bit.
        row.set_string("name", "x").unwrap();
        assert!(!row.is_null(1));

        assert_matches::assert_matches!(
            row.set_null("score"),
            Err(Error::NotNullable { name }) if name == "score"
        );
    }

    #[test]
    fn test_mutation_errors() {
        let mut row = PartialRow::new(test_schema());

        assert_matches::assert_matches!(
            row.set_i32("nope", 1),
            Err(Error::UnknownColumn { name }) if name == "nope"
        );
        assert_matches::assert_matches!(
            row.set_i64("key", 1),
            Err(Error::TypeMismatch { given: DataType::Int64, .. })
        );

        // Failed mutations leave the row untouched.
        assert!(!row.is_set(0));
    }

    #[test]
    fn test_freeze() {
        let mut row = PartialRow::new(test_schema());
        row.set_i32("key", 1).unwrap();
        row.freeze();
        assert!(row.is_frozen());

        assert_matches::assert_matches!(row.set_i32("key", 2), Err(Error::Frozen));
        assert_matches::assert_matches!(row.set_null("name"), Err(Error::Frozen));
        assert_eq!(row.fixed_cell(0), 1_i32.to_le_bytes());
    }
}
