//! Partition schemas.
//!
//! A table's rows are horizontally partitioned into tablets. The partition
//! schema maps each row to a byte-string partition key: zero or more hash
//! components (each contributing a big-endian 4-byte bucket id) followed by
//! the order-preserving encoding of the range columns. Tablets own
//! contiguous, non-overlapping ranges of partition-key space.

use crate::schema::Schema;

/// One hash component of a partition schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSchema {
    /// Indexes of the columns hashed by this component.
    pub column_indexes: Vec<usize>,
    /// Number of buckets; each row maps to `hash % num_buckets`.
    pub num_buckets: u32,
    /// Seed mixed into the hash, allowing tables to disambiguate otherwise
    /// identical components.
    pub seed: u32,
}

impl HashSchema {
    /// A hash component over `column_indexes` with `num_buckets` buckets and
    /// seed 0.
    pub fn new(column_indexes: Vec<usize>, num_buckets: u32) -> Self {
        Self {
            column_indexes,
            num_buckets,
            seed: 0,
        }
    }
}

/// The range component of a partition schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSchema {
    /// Indexes of the columns that make up the range key, in significance
    /// order.
    pub column_indexes: Vec<usize>,
}

/// How a table maps rows to partition keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSchema {
    /// Hash components, applied in order.
    pub hash_schemas: Vec<HashSchema>,
    /// The range component. May cover no columns, in which case the range
    /// portion of every partition key is empty.
    pub range: RangeSchema,
}

impl PartitionSchema {
    /// The default partitioning for a table that specifies none: range
    /// partitioning over the full primary key, no hash components.
    pub fn simple_range(schema: &Schema) -> Self {
        Self {
            hash_schemas: Vec::new(),
            range: RangeSchema {
                column_indexes: (0..schema.num_key_columns()).collect(),
            },
        }
    }
}

/// The partition-key interval owned by one tablet.
///
/// Bounds are byte strings in partition-key space; the lower bound is
/// inclusive, the upper exclusive. An empty bound is unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Inclusive lower bound; empty means negative infinity.
    pub lower_bound: Vec<u8>,
    /// Exclusive upper bound; empty means positive infinity.
    pub upper_bound: Vec<u8>,
}

impl Partition {
    /// A partition covering all of partition-key space.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A partition covering `[lower, upper)`.
    pub fn new(lower_bound: Vec<u8>, upper_bound: Vec<u8>) -> Self {
        Self {
            lower_bound,
            upper_bound,
        }
    }

    /// Whether `partition_key` falls inside this partition.
    pub fn covers(&self, partition_key: &[u8]) -> bool {
        partition_key >= self.lower_bound.as_slice()
            && (self.upper_bound.is_empty() || partition_key < self.upper_bound.as_slice())
    }
}
