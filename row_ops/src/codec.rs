//! The row-operations wire codec.
//!
//! A batch of row operations sharing one schema is packed into two
//! contiguous blobs: `rows`, the concatenation of per-row records, and
//! `indirect_data`, the concatenation of variable-length cell payloads.
//!
//! Per-row record layout:
//!
//! ```text
//! 1 byte change type
//! columns-set bitset        (one bit per column, LSB-first)
//! nulls bitset              (only present when the schema has any
//!                            nullable column)
//! for each set, non-NULL column in schema order:
//!     fixed-width cell bytes, or
//!     u64 offset | u64 length into indirect_data   (variable-length)
//! ```
//!
//! All multi-byte integers are little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use data_types::Schema;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::row::PartialRow;

/// Errors returned by the codec. Encode-side errors are programmer errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("all operations in a batch must share one schema"))]
    SchemaMismatch,

    #[snafu(display("primary key column {name} is not set"))]
    KeyNotSet { name: String },

    #[snafu(display("unknown change type byte: {byte:#04x}"))]
    UnknownChangeType { byte: u8 },

    #[snafu(display("row data truncated at byte {offset}"))]
    Truncated { offset: usize },

    #[snafu(display(
        "indirect reference ({offset}, {length}) out of bounds ({indirect_len} bytes)"
    ))]
    IndirectOutOfBounds {
        offset: u64,
        length: u64,
        indirect_len: usize,
    },

    #[snafu(display("failed to reassemble decoded row: {source}"))]
    Reassemble { source: crate::row::Error },
}

/// A specialized `Error` for codec errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The change a single row operation makes, together with the pseudo-types
/// the same encoding uses for range-partition descriptors at table-creation
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    SplitRow,
    Upsert,
    RangeLowerBound,
    RangeUpperBound,
    ExclusiveRangeLowerBound,
    InclusiveRangeUpperBound,
}

impl ChangeType {
    /// The wire byte identifying this change type.
    pub fn to_wire_byte(self) -> u8 {
        match self {
            Self::Insert => 1,
            Self::Update => 2,
            Self::Delete => 3,
            Self::SplitRow => 4,
            Self::Upsert => 5,
            Self::RangeLowerBound => 6,
            Self::RangeUpperBound => 7,
            Self::ExclusiveRangeLowerBound => 8,
            Self::InclusiveRangeUpperBound => 9,
        }
    }

    /// Decode a wire byte.
    pub fn from_wire_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::Insert,
            2 => Self::Update,
            3 => Self::Delete,
            4 => Self::SplitRow,
            5 => Self::Upsert,
            6 => Self::RangeLowerBound,
            7 => Self::RangeUpperBound,
            8 => Self::ExclusiveRangeLowerBound,
            9 => Self::InclusiveRangeUpperBound,
            _ => return None,
        })
    }

    /// Whether this type is a row mutation (as opposed to a range-partition
    /// descriptor). Mutations must carry a fully-set primary key.
    pub fn is_row_mutation(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::Upsert
        )
    }
}

/// Whether a range-partition bound is inclusive or exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RangeBound {
    Inclusive,
    Exclusive,
}

/// The encoded payload: per-row records plus the indirect data they point
/// into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowOperations {
    /// Concatenated per-row records.
    pub rows: Bytes,
    /// Concatenated variable-length cell payloads.
    pub indirect_data: Bytes,
}

impl RowOperations {
    /// Total payload size in bytes.
    pub fn total_size(&self) -> usize {
        self.rows.len() + self.indirect_data.len()
    }
}

/// One decoded row operation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOperation {
    /// The decoded change type.
    pub change_type: ChangeType,
    /// The reassembled row.
    pub row: PartialRow,
}

struct Encoder {
    schema: Schema,
    bitset_bytes: usize,
    rows: BytesMut,
    indirect: BytesMut,
}

impl Encoder {
    fn new(schema: Schema, num_ops: usize) -> Self {
        let bitset_bytes = schema.num_columns().div_ceil(8);
        // Upper bound on the fixed area: every column of every row set and
        // non-NULL. The indirect buffer grows by appending.
        let mut per_row = 1 + schema.row_size() + bitset_bytes;
        if schema.has_nullable_columns() {
            per_row += bitset_bytes;
        }
        Self {
            schema,
            bitset_bytes,
            rows: BytesMut::with_capacity(per_row * num_ops),
            indirect: BytesMut::new(),
        }
    }

    fn encode_row(&mut self, change_type: ChangeType, row: &PartialRow) -> Result<()> {
        ensure!(*row.schema() == self.schema, SchemaMismatchSnafu);
        if change_type.is_row_mutation() && !row.is_key_set() {
            let name = (0..self.schema.num_key_columns())
                .find(|&idx| !row.is_set(idx) || row.is_null(idx))
                .map(|idx| self.schema.columns()[idx].name().to_owned())
                .unwrap_or_default();
            return KeyNotSetSnafu { name }.fail();
        }

        self.rows.put_u8(change_type.to_wire_byte());
        debug_assert_eq!(row.set_bits().byte_len(), self.bitset_bytes);
        self.rows.put_slice(row.set_bits().bytes());
        if self.schema.has_nullable_columns() {
            self.rows.put_slice(row.null_bits().bytes());
        }

        for (idx, col) in self.schema.columns().iter().enumerate() {
            if !row.is_set(idx) || row.is_null(idx) {
                continue;
            }
            if col.data_type().is_var_len() {
                let cell = row.var_len_cell(idx);
                self.rows.put_u64_le(self.indirect.len() as u64);
                self.rows.put_u64_le(cell.len() as u64);
                self.indirect.put_slice(cell);
            } else {
                self.rows.put_slice(row.fixed_cell(idx));
            }
        }
        Ok(())
    }

    fn finish(self) -> RowOperations {
        RowOperations {
            rows: self.rows.freeze(),
            indirect_data: self.indirect.freeze(),
        }
    }
}

/// Encode `ops` into the row-operations payload.
///
/// All rows must share the schema of the first operation. Returns `None`
/// for an empty input. The encoding is deterministic: rows are emitted in
/// input order and indirect data in cell order.
pub fn encode_operations(ops: &[(ChangeType, &PartialRow)]) -> Result<Option<RowOperations>> {
    let Some((_, first)) = ops.first() else {
        return Ok(None);
    };

    let mut encoder = Encoder::new(first.schema().clone(), ops.len());
    for (change_type, row) in ops {
        encoder.encode_row(*change_type, row)?;
    }
    Ok(Some(encoder.finish()))
}

/// A range partition of a table, described by its two bound rows.
#[derive(Debug, Clone)]
pub struct RangePartition {
    /// Lower bound row; may set only a prefix of the range columns.
    pub lower: PartialRow,
    /// Upper bound row; may set only a prefix of the range columns.
    pub upper: PartialRow,
    /// Whether `lower` is inclusive.
    pub lower_bound: RangeBound,
    /// Whether `upper` is inclusive.
    pub upper_bound: RangeBound,
}

impl RangePartition {
    fn lower_change_type(&self) -> ChangeType {
        match self.lower_bound {
            RangeBound::Inclusive => ChangeType::RangeLowerBound,
            RangeBound::Exclusive => ChangeType::ExclusiveRangeLowerBound,
        }
    }

    fn upper_change_type(&self) -> ChangeType {
        match self.upper_bound {
            RangeBound::Exclusive => ChangeType::RangeUpperBound,
            RangeBound::Inclusive => ChangeType::InclusiveRangeUpperBound,
        }
    }
}

/// Encode range-partition descriptors and split rows as pseudo-row
/// operations, the form the master expects at table-creation time.
pub fn encode_range_partitions(
    partitions: &[RangePartition],
    split_rows: &[PartialRow],
) -> Result<Option<RowOperations>> {
    let schema = match (split_rows.first(), partitions.first()) {
        (Some(row), _) => row.schema().clone(),
        (None, Some(partition)) => partition.lower.schema().clone(),
        (None, None) => return Ok(None),
    };

    let mut encoder = Encoder::new(schema, split_rows.len() + 2 * partitions.len());
    for row in split_rows {
        encoder.encode_row(ChangeType::SplitRow, row)?;
    }
    for partition in partitions {
        encoder.encode_row(partition.lower_change_type(), &partition.lower)?;
        encoder.encode_row(partition.upper_change_type(), &partition.upper)?;
    }
    Ok(Some(encoder.finish()))
}

/// Encode a single `[lower, upper)`-style bound pair.
pub fn encode_range_bounds(
    lower: &PartialRow,
    lower_bound: RangeBound,
    upper: &PartialRow,
    upper_bound: RangeBound,
) -> Result<RowOperations> {
    let partition = RangePartition {
        lower: lower.clone(),
        upper: upper.clone(),
        lower_bound,
        upper_bound,
    };
    let mut encoder = Encoder::new(lower.schema().clone(), 2);
    encoder.encode_row(partition.lower_change_type(), lower)?;
    encoder.encode_row(partition.upper_change_type(), upper)?;
    Ok(encoder.finish())
}

struct Decoder<'a> {
    schema: &'a Schema,
    rows: &'a [u8],
    indirect: &'a Bytes,
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).context(TruncatedSnafu {
            offset: self.rows.len(),
        })?;
        ensure!(end <= self.rows.len(), TruncatedSnafu { offset: self.pos });
        let slice = &self.rows[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn decode_row(&mut self) -> Result<DecodedOperation> {
        let schema = self.schema;

        let byte = self.take(1)?[0];
        let change_type =
            ChangeType::from_wire_byte(byte).context(UnknownChangeTypeSnafu { byte })?;

        let bitset_bytes = schema.num_columns().div_ceil(8);
        let mut set_bits = crate::bitset::BitSet::with_size(schema.num_columns());
        set_bits.load(self.take(bitset_bytes)?);

        let mut null_bits = crate::bitset::BitSet::with_size(schema.num_columns());
        if schema.has_nullable_columns() {
            null_bits.load(self.take(bitset_bytes)?);
        }

        let mut row = PartialRow::new(schema.clone());
        for (idx, col) in schema.columns().iter().enumerate() {
            if !set_bits.get(idx) {
                continue;
            }
            let name = col.name();
            if null_bits.get(idx) {
                row.set_null(name).context(ReassembleSnafu)?;
                continue;
            }
            if col.data_type().is_var_len() {
                let offset = u64::from_le_bytes(self.take(8)?.try_into().unwrap());
                let length = u64::from_le_bytes(self.take(8)?.try_into().unwrap());
                let end = offset.checked_add(length);
                ensure!(
                    end.is_some_and(|end| end <= self.indirect.len() as u64),
                    IndirectOutOfBoundsSnafu {
                        offset,
                        length,
                        indirect_len: self.indirect.len(),
                    }
                );
                // Zero-copy view of the cell payload.
                let cell = self
                    .indirect
                    .slice(offset as usize..(offset + length) as usize);
                match col.data_type() {
                    data_types::DataType::String => row
                        .set_string(name, String::from_utf8_lossy(&cell).into_owned())
                        .context(ReassembleSnafu)?,
                    _ => row.set_binary(name, cell).context(ReassembleSnafu)?,
                }
            } else {
                let cell = self.take(col.data_type().size())?;
                match col.data_type() {
                    data_types::DataType::Bool => row
                        .set_bool(name, cell[0] != 0)
                        .context(ReassembleSnafu)?,
                    data_types::DataType::Int8 => row
                        .set_i8(name, cell[0] as i8)
                        .context(ReassembleSnafu)?,
                    data_types::DataType::Int16 => row
                        .set_i16(name, i16::from_le_bytes(cell.try_into().unwrap()))
                        .context(ReassembleSnafu)?,
                    data_types::DataType::Int32 => row
                        .set_i32(name, i32::from_le_bytes(cell.try_into().unwrap()))
                        .context(ReassembleSnafu)?,
                    data_types::DataType::Int64 => row
                        .set_i64(name, i64::from_le_bytes(cell.try_into().unwrap()))
                        .context(ReassembleSnafu)?,
                    data_types::DataType::UnixtimeMicros => row
                        .set_unixtime_micros(name, i64::from_le_bytes(cell.try_into().unwrap()))
                        .context(ReassembleSnafu)?,
                    data_types::DataType::Float => row
                        .set_f32(name, f32::from_le_bytes(cell.try_into().unwrap()))
                        .context(ReassembleSnafu)?,
                    data_types::DataType::Double => row
                        .set_f64(name, f64::from_le_bytes(cell.try_into().unwrap()))
                        .context(ReassembleSnafu)?,
                    data_types::DataType::String | data_types::DataType::Binary => {
                        unreachable!("var-len handled above")
                    }
                }
            }
        }

        Ok(DecodedOperation { change_type, row })
    }
}

/// Decode a row-operations payload back into its constituent operations.
///
/// The inverse of [`encode_operations`] for the same schema; used by tests
/// and diagnostic tooling rather than the hot write path.
pub fn decode_operations(schema: &Schema, ops: &RowOperations) -> Result<Vec<DecodedOperation>> {
    let mut decoder = Decoder {
        schema,
        rows: &ops.rows[..],
        indirect: &ops.indirect_data,
        pos: 0,
    };

    let mut decoded = Vec::new();
    while decoder.pos < decoder.rows.len() {
        decoded.push(decoder.decode_row()?);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{ColumnSchema, DataType};

    fn test_schema() -> Schema {
        Schema::new(vec![
            ColumnSchema::new("key", DataType::Int32).key(),
            ColumnSchema::new("val", DataType::String).nullable(),
        ])
        .unwrap()
    }

    fn row(key: i32, val: Option<&str>) -> PartialRow {
        let mut row = PartialRow::new(test_schema());
        row.set_i32("key", key).unwrap();
        match val {
            Some(v) => row.set_string("val", v).unwrap(),
            None => row.set_null("val").unwrap(),
        }
        row
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(encode_operations(&[]).unwrap(), None);
        assert_eq!(encode_range_partitions(&[], &[]).unwrap(), None);
    }

    #[test]
    fn test_golden_layout() {
        let r = row(1, Some("abc"));
        let ops = encode_operations(&[(ChangeType::Insert, &r)])
            .unwrap()
            .unwrap();

        // 1 change byte, 1 set-bitset byte, 1 nulls-bitset byte, 4 bytes of
        // int32, 16 bytes of indirect reference.
        let mut want = vec![
            1_u8,        // INSERT
            0b0000_0011, // both columns set
            0b0000_0000, // nothing NULL
        ];
        want.extend_from_slice(&1_i32.to_le_bytes());
        want.extend_from_slice(&0_u64.to_le_bytes()); // indirect offset
        want.extend_from_slice(&3_u64.to_le_bytes()); // cell length
        assert_eq!(&ops.rows[..], want);
        assert_eq!(&ops.indirect_data[..], b"abc");
        assert_eq!(ops.total_size(), want.len() + 3);
    }

    #[test]
    fn test_null_and_unset_cells_take_no_space() {
        let r = row(7, None);
        let ops = encode_operations(&[(ChangeType::Update, &r)])
            .unwrap()
            .unwrap();

        let mut want = vec![
            2_u8,        // UPDATE
            0b0000_0011, // both columns set
            0b0000_0010, // val NULL
        ];
        want.extend_from_slice(&7_i32.to_le_bytes());
        assert_eq!(&ops.rows[..], want);
        assert!(ops.indirect_data.is_empty());
    }

    #[test]
    fn test_indirect_offsets_accumulate() {
        let a = row(1, Some("aa"));
        let b = row(2, Some("bbbb"));
        let ops = encode_operations(&[(ChangeType::Insert, &a), (ChangeType::Insert, &b)])
            .unwrap()
            .unwrap();

        assert_eq!(&ops.indirect_data[..], b"aabbbb");
        // Second row's indirect slot: offset 2, length 4.
        let second = &ops.rows[ops.rows.len() - 16..];
        assert_eq!(&second[..8], 2_u64.to_le_bytes());
        assert_eq!(&second[8..], 4_u64.to_le_bytes());
    }

    #[test]
    fn test_no_nulls_bitset_without_nullable_columns() {
        let schema = Schema::new(vec![ColumnSchema::new("k", DataType::Int64).key()]).unwrap();
        let mut r = PartialRow::new(schema.clone());
        r.set_i64("k", -1).unwrap();

        let ops = encode_operations(&[(ChangeType::Delete, &r)])
            .unwrap()
            .unwrap();
        // change byte + 1 bitset byte + 8 bytes of int64, no nulls bitset.
        assert_eq!(ops.rows.len(), 1 + 1 + 8);

        let decoded = decode_operations(&schema, &ops).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].change_type, ChangeType::Delete);
        assert_eq!(decoded[0].row, r);
    }

    #[test]
    fn test_round_trip() {
        let schema = test_schema();
        let rows = vec![
            (ChangeType::Insert, row(1, Some("abc"))),
            (ChangeType::Upsert, row(2, None)),
            (ChangeType::Delete, {
                let mut r = PartialRow::new(schema.clone());
                r.set_i32("key", 3).unwrap();
                r
            }),
            (ChangeType::Insert, row(4, Some(""))),
        ];

        let ops = encode_operations(
            &rows
                .iter()
                .map(|(ct, r)| (*ct, r))
                .collect::<Vec<_>>(),
        )
        .unwrap()
        .unwrap();

        let decoded = decode_operations(&schema, &ops).unwrap();
        assert_eq!(decoded.len(), rows.len());
        for ((change_type, row), decoded) in rows.iter().zip(&decoded) {
            assert_eq!(decoded.change_type, *change_type);
            assert_eq!(&decoded.row, row);
        }
    }

    #[test]
    fn test_identical_ops_round_trip() {
        let r = row(9, Some("same"));
        let input: Vec<_> = std::iter::repeat((ChangeType::Insert, &r)).take(10).collect();
        let ops = encode_operations(&input).unwrap().unwrap();

        let decoded = decode_operations(&test_schema(), &ops).unwrap();
        assert_eq!(decoded.len(), 10);
        for d in &decoded {
            assert_eq!(d.change_type, ChangeType::Insert);
            assert_eq!(&d.row, &r);
        }
    }

    #[test]
    fn test_mixed_schemas_rejected() {
        let other = Schema::new(vec![ColumnSchema::new("x", DataType::Int32).key()]).unwrap();
        let mut foreign = PartialRow::new(other);
        foreign.set_i32("x", 1).unwrap();
        let native = row(1, Some("v"));

        let err = encode_operations(&[
            (ChangeType::Insert, &native),
            (ChangeType::Insert, &foreign),
        ])
        .unwrap_err();
        assert_matches::assert_matches!(err, Error::SchemaMismatch);
    }

    #[test]
    fn test_unset_key_rejected() {
        let mut r = PartialRow::new(test_schema());
        r.set_string("val", "no key").unwrap();
        let err = encode_operations(&[(ChangeType::Insert, &r)]).unwrap_err();
        assert_matches::assert_matches!(err, Error::KeyNotSet { name } if name == "key");
    }

    #[test]
    fn test_range_bounds_may_omit_key() {
        // Bound rows legitimately set only a prefix of the range columns.
        let lower = PartialRow::new(test_schema());
        let mut upper = PartialRow::new(test_schema());
        upper.set_i32("key", 100).unwrap();

        let ops =
            encode_range_bounds(&lower, RangeBound::Inclusive, &upper, RangeBound::Exclusive)
                .unwrap();
        let decoded = decode_operations(&test_schema(), &ops).unwrap();
        assert_eq!(decoded[0].change_type, ChangeType::RangeLowerBound);
        assert_eq!(decoded[1].change_type, ChangeType::RangeUpperBound);
        assert!(!decoded[0].row.is_set(0));
    }

    #[test]
    fn test_range_partitions_with_splits() {
        let mut split = PartialRow::new(test_schema());
        split.set_i32("key", 50).unwrap();

        let partition = RangePartition {
            lower: {
                let mut r = PartialRow::new(test_schema());
                r.set_i32("key", 0).unwrap();
                r
            },
            upper: {
                let mut r = PartialRow::new(test_schema());
                r.set_i32("key", 100).unwrap();
                r
            },
            lower_bound: RangeBound::Exclusive,
            upper_bound: RangeBound::Inclusive,
        };

        let ops = encode_range_partitions(&[partition], &[split])
            .unwrap()
            .unwrap();
        let decoded = decode_operations(&test_schema(), &ops).unwrap();
        let types: Vec<_> = decoded.iter().map(|d| d.change_type).collect();
        assert_eq!(
            types,
            vec![
                ChangeType::SplitRow,
                ChangeType::ExclusiveRangeLowerBound,
                ChangeType::InclusiveRangeUpperBound,
            ]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let schema = test_schema();

        let bad_type = RowOperations {
            rows: Bytes::from_static(&[0xEE, 0x00, 0x00]),
            indirect_data: Bytes::new(),
        };
        assert_matches::assert_matches!(
            decode_operations(&schema, &bad_type).unwrap_err(),
            Error::UnknownChangeType { byte: 0xEE }
        );

        let truncated = RowOperations {
            rows: Bytes::from_static(&[1, 0b0000_0001]),
            indirect_data: Bytes::new(),
        };
        assert_matches::assert_matches!(
            decode_operations(&schema, &truncated).unwrap_err(),
            Error::Truncated { .. }
        );

        // An indirect slot pointing past the indirect blob.
        let r = row(1, Some("abc"));
        let mut ops = encode_operations(&[(ChangeType::Insert, &r)])
            .unwrap()
            .unwrap();
        ops.indirect_data = Bytes::new();
        assert_matches::assert_matches!(
            decode_operations(&schema, &ops).unwrap_err(),
            Error::IndirectOutOfBounds { .. }
        );
    }

    #[test]
    fn test_wire_bytes_stable() {
        for (ct, byte) in [
            (ChangeType::Insert, 1),
            (ChangeType::Update, 2),
            (ChangeType::Delete, 3),
            (ChangeType::SplitRow, 4),
            (ChangeType::Upsert, 5),
            (ChangeType::RangeLowerBound, 6),
            (ChangeType::RangeUpperBound, 7),
            (ChangeType::ExclusiveRangeLowerBound, 8),
            (ChangeType::InclusiveRangeUpperBound, 9),
        ] {
            assert_eq!(ct.to_wire_byte(), byte);
            assert_eq!(ChangeType::from_wire_byte(byte), Some(ct));
        }
        assert_eq!(ChangeType::from_wire_byte(0), None);
    }
}
