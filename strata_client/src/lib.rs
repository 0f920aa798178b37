//! The Strata client write session.
//!
//! A [`WriteSession`] accepts individual row mutations, groups them by
//! destination tablet, and dispatches them as batched write RPCs to the
//! tablet servers. Double buffering lets the application keep writing into
//! one buffer while the other is flushing; admission control bounds the
//! amount of buffered data and sheds load smoothly as the flush pipeline
//! falls behind.
//!
//! The session consumes two collaborators supplied by the surrounding
//! client: a [`WriteRpc`] transport, which owns framing, retries, and
//! reconnection, and a [`TabletLocator`], which resolves partition keys to
//! tablets from the cluster metadata cache.
//!
//! A session is not safe for concurrent [`WriteSession::apply`] calls;
//! callers needing concurrency open one session per thread of work.
//! Operations applied in order into one buffer and addressed to the same
//! tablet are written in that order. No ordering is guaranteed across
//! buffers: up to two buffers flush concurrently, so back-to-back flushes
//! touching the same tablet may be reordered by the server. Applications
//! that need strict ordering either await each flush before applying more,
//! or run in [`FlushMode::AutoFlushSync`] and await every operation.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod batch;
mod buffer;
mod config;
mod error;
mod error_collector;
mod operation;
mod response;
pub mod rpc;
pub mod router;
mod session;
mod statistics;
pub mod test_util;

pub use buffer::FlushNotification;
pub use config::{ExternalConsistencyMode, FlushMode};
pub use error::{ApplyError, SessionError};
pub use operation::{Table, WriteOperation};
pub use response::{
    FailedOperation, OperationResponse, PendingErrors, RowError, RowErrorCode,
};
pub use rpc::WriteRpc;
pub use router::TabletLocator;
pub use session::{FlushJoin, OperationJoin, WriteSession};
pub use statistics::{Statistic, Statistics};

pub use row_ops::ChangeType;
