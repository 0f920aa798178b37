//! Row buffers and the row-operations wire codec.
//!
//! A [`PartialRow`] holds the column values an application has explicitly
//! assigned for one row mutation. [`codec`] packs a batch of rows sharing a
//! schema into the binary row-operations payload consumed by tablet servers,
//! and [`partition_key`] derives the tablet-routing key for a row.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod bitset;
pub mod codec;
pub mod partition_key;
pub mod row;

pub use bitset::BitSet;
pub use codec::{ChangeType, DecodedOperation, RangeBound, RowOperations};
pub use partition_key::encode_partition_key;
pub use row::PartialRow;
