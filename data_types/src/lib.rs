//! Shared data types for the Strata client: table and tablet identifiers,
//! column schemas, and partition schemas.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod ids;
pub mod partition;
pub mod schema;

pub use ids::{TableId, TabletId};
pub use partition::{HashSchema, Partition, PartitionSchema, RangeSchema};
pub use schema::{ColumnSchema, DataType, Schema, SchemaError};
