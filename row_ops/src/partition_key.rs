//! Partition-key derivation.
//!
//! A row's partition key is the concatenation of one big-endian 4-byte
//! bucket id per hash component followed by the order-preserving encoding
//! of the range columns. The range portion sorts byte-wise in the same
//! order as the underlying column values, which is what lets tablets own
//! contiguous key ranges.

use data_types::{DataType, PartitionSchema, Schema};
use snafu::{ensure, Snafu};

use crate::row::PartialRow;

/// Errors returned while deriving a partition key. All are programmer
/// errors: the row is missing or misusing a partition column.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("partition column {name} is not set"))]
    ColumnNotSet { name: String },

    #[snafu(display("partition column {name} cannot be NULL"))]
    NullColumn { name: String },

    #[snafu(display("column {name} has type {data_type} which cannot be a partition column"))]
    TypeNotAllowed { name: String, data_type: DataType },
}

/// A specialized `Error` for partition-key errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Derive the tablet-routing key for `row` under `partition_schema`.
pub fn encode_partition_key(
    partition_schema: &PartitionSchema,
    schema: &Schema,
    row: &PartialRow,
) -> Result<Vec<u8>> {
    let mut key = Vec::new();

    for hash_schema in &partition_schema.hash_schemas {
        let mut hashed = Vec::new();
        encode_columns(schema, row, &hash_schema.column_indexes, &mut hashed)?;
        let bucket = murmur2_64(&hashed, hash_schema.seed as u64) % hash_schema.num_buckets as u64;
        key.extend_from_slice(&(bucket as u32).to_be_bytes());
    }

    encode_columns(schema, row, &partition_schema.range.column_indexes, &mut key)?;
    Ok(key)
}

/// Encode the given columns of `row` in significance order, appending to
/// `out`.
fn encode_columns(
    schema: &Schema,
    row: &PartialRow,
    column_indexes: &[usize],
    out: &mut Vec<u8>,
) -> Result<()> {
    for (pos, &idx) in column_indexes.iter().enumerate() {
        let last = pos + 1 == column_indexes.len();
        encode_column(schema, row, idx, last, out)?;
    }
    Ok(())
}

fn encode_column(
    schema: &Schema,
    row: &PartialRow,
    idx: usize,
    is_last: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    let col = &schema.columns()[idx];
    let name = col.name();
    ensure!(
        row.is_set(idx),
        ColumnNotSetSnafu {
            name: name.to_owned()
        }
    );
    ensure!(
        !row.is_null(idx),
        NullColumnSnafu {
            name: name.to_owned()
        }
    );

    match col.data_type() {
        // Fixed-width integers: big-endian with the sign bit flipped, so
        // that byte order matches numeric order.
        DataType::Int8 => {
            let cell = row.fixed_cell(idx);
            out.push(cell[0] ^ 0x80);
        }
        DataType::Int16 => {
            let v = i16::from_le_bytes(row.fixed_cell(idx).try_into().unwrap());
            out.extend_from_slice(&((v as u16) ^ (1 << 15)).to_be_bytes());
        }
        DataType::Int32 => {
            let v = i32::from_le_bytes(row.fixed_cell(idx).try_into().unwrap());
            out.extend_from_slice(&((v as u32) ^ (1 << 31)).to_be_bytes());
        }
        DataType::Int64 | DataType::UnixtimeMicros => {
            let v = i64::from_le_bytes(row.fixed_cell(idx).try_into().unwrap());
            out.extend_from_slice(&((v as u64) ^ (1 << 63)).to_be_bytes());
        }
        // Variable-length columns: raw bytes. A non-terminal column is
        // followed by 0x00 0x00, with embedded 0x00 bytes escaped as
        // 0x00 0x01 so that the terminator sorts below any continuation.
        DataType::String | DataType::Binary => {
            let cell = row.var_len_cell(idx);
            if is_last {
                out.extend_from_slice(cell);
            } else {
                for &b in cell.iter() {
                    out.push(b);
                    if b == 0 {
                        out.push(1);
                    }
                }
                out.extend_from_slice(&[0, 0]);
            }
        }
        data_type @ (DataType::Bool | DataType::Float | DataType::Double) => {
            return TypeNotAllowedSnafu {
                name: name.to_owned(),
                data_type,
            }
            .fail();
        }
    }
    Ok(())
}

/// MurmurHash2, 64-bit variant A.
///
/// This arithmetic defines which bucket a row hashes to and therefore which
/// tablet owns it; it must match the server side exactly.
fn murmur2_64(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate() {
            h ^= (b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{ColumnSchema, HashSchema, RangeSchema};

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnSchema::new("host", DataType::String).key(),
            ColumnSchema::new("metric", DataType::String).key(),
            ColumnSchema::new("time", DataType::Int64).key(),
            ColumnSchema::new("value", DataType::Double),
        ])
        .unwrap()
    }

    fn row(host: &str, metric: &str, time: i64) -> PartialRow {
        let mut row = PartialRow::new(schema());
        row.set_string("host", host).unwrap();
        row.set_string("metric", metric).unwrap();
        row.set_i64("time", time).unwrap();
        row
    }

    #[test]
    fn test_simple_range_key() {
        let ps = PartitionSchema::simple_range(&schema());
        let key = encode_partition_key(&ps, &schema(), &row("a", "b", 0)).unwrap();

        let mut want = Vec::new();
        want.extend_from_slice(b"a");
        want.extend_from_slice(&[0, 0]);
        want.extend_from_slice(b"b");
        want.extend_from_slice(&[0, 0]);
        want.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(key, want);
    }

    #[test]
    fn test_range_key_order_preserving() {
        let ps = PartitionSchema::simple_range(&schema());
        let s = schema();

        let keys: Vec<_> = [
            ("a", "a", i64::MIN),
            ("a", "a", -1),
            ("a", "a", 0),
            ("a", "a", i64::MAX),
            ("a", "b", i64::MIN),
            ("b", "", i64::MIN),
        ]
        .iter()
        .map(|(h, m, t)| encode_partition_key(&ps, &s, &row(h, m, *t)).unwrap())
        .collect();

        for window in keys.windows(2) {
            assert!(window[0] < window[1], "{:?} !< {:?}", window[0], window[1]);
        }
    }

    #[test]
    fn test_embedded_nul_escaped() {
        let ps = PartitionSchema::simple_range(&schema());
        let s = schema();

        // "a\0" must sort between "a" and "a\x01" after encoding even
        // though the raw terminator contains 0x00 bytes.
        let k1 = encode_partition_key(&ps, &s, &row("a", "", 0)).unwrap();
        let k2 = encode_partition_key(&ps, &s, &row("a\0", "", 0)).unwrap();
        let k3 = encode_partition_key(&ps, &s, &row("a\x01", "", 0)).unwrap();
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_hash_buckets() {
        let ps = PartitionSchema {
            hash_schemas: vec![HashSchema::new(vec![0], 16), HashSchema::new(vec![1], 4)],
            range: RangeSchema {
                column_indexes: vec![2],
            },
        };
        let s = schema();

        let key = encode_partition_key(&ps, &s, &row("web01", "cpu", 99)).unwrap();
        // Two 4-byte bucket prefixes plus the 8-byte range portion.
        assert_eq!(key.len(), 4 + 4 + 8);

        let bucket0 = u32::from_be_bytes(key[0..4].try_into().unwrap());
        let bucket1 = u32::from_be_bytes(key[4..8].try_into().unwrap());
        assert!(bucket0 < 16);
        assert!(bucket1 < 4);

        // Deterministic across invocations.
        let again = encode_partition_key(&ps, &s, &row("web01", "cpu", 99)).unwrap();
        assert_eq!(key, again);

        // The hash prefix depends only on the hashed columns.
        let other_time = encode_partition_key(&ps, &s, &row("web01", "cpu", -5)).unwrap();
        assert_eq!(&key[..8], &other_time[..8]);
    }

    #[test]
    fn test_seed_changes_buckets() {
        let s = schema();
        let buckets = |seed: u32| {
            let ps = PartitionSchema {
                hash_schemas: vec![HashSchema {
                    column_indexes: vec![0],
                    num_buckets: 1 << 16,
                    seed,
                }],
                range: RangeSchema {
                    column_indexes: vec![],
                },
            };
            encode_partition_key(&ps, &s, &row("web01", "cpu", 0)).unwrap()
        };

        assert_ne!(buckets(0), buckets(1));
    }

    #[test]
    fn test_missing_partition_column() {
        let ps = PartitionSchema::simple_range(&schema());
        let mut row = PartialRow::new(schema());
        row.set_string("host", "h").unwrap();

        let err = encode_partition_key(&ps, &schema(), &row).unwrap_err();
        assert_matches::assert_matches!(err, Error::ColumnNotSet { name } if name == "metric");
    }

    #[test]
    fn test_murmur2_sanity() {
        // The empty input with seed 0 hashes to 0 in MurmurHash64A.
        assert_eq!(murmur2_64(b"", 0), 0);
        assert_ne!(murmur2_64(b"a", 0), murmur2_64(b"b", 0));
        // Exercise both the 8-byte block path and the tail path.
        assert_ne!(murmur2_64(b"abcdefgh", 0), murmur2_64(b"abcdefgi", 0));
        assert_ne!(murmur2_64(b"abcdefghij", 0), murmur2_64(b"abcdefghik", 0));
        // Length participates in the hash.
        assert_ne!(murmur2_64(b"aa", 0), murmur2_64(b"aa\0", 0));
    }
}
