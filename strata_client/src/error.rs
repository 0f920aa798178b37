//! Session error types.

use thiserror::Error;

use crate::buffer::FlushNotification;
use crate::operation::WriteOperation;

/// Errors reported by the session outside of the per-row channel.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A configuration setter was invoked while operations were pending.
    #[error("cannot change configuration while operations are buffered")]
    PendingOperations,

    /// The low-watermark percentage is outside `[0.0, 1.0]`.
    #[error("low watermark must be between 0 and 1 inclusively, got {given}")]
    InvalidLowWatermark {
        /// The rejected value.
        given: f32,
    },

    /// The operation's row is invalid (for example, a partition-key column
    /// is unset).
    #[error("invalid operation: {source}")]
    InvalidOperation {
        /// The underlying row error.
        #[from]
        source: row_ops::partition_key::Error,
    },

    /// The session was dropped before the operation completed.
    #[error("session dropped before the operation completed")]
    Cancelled,
}

/// Errors returned from `apply`. The variants that reject an operation
/// without consuming it hand it back to the caller for a later retry.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Both buffers are flushing; the session cannot admit the operation
    /// right now. The row has not been frozen or buffered. Await
    /// [`notification`](Self::Throttled::notification) before retrying to
    /// avoid busy-waiting.
    #[error("all buffers are currently flushing")]
    Throttled {
        /// The rejected operation, unchanged.
        op: Box<WriteOperation>,
        /// Fires when a buffer finishes flushing and capacity is likely
        /// available again.
        notification: FlushNotification,
    },

    /// Manual flush mode is enabled and the buffer is full; flush before
    /// applying more.
    #[error("manual flush is enabled but the buffer is too big")]
    BufferFull {
        /// The rejected operation, unchanged.
        op: Box<WriteOperation>,
    },

    /// A programmer error independent of buffer state.
    #[error(transparent)]
    Session(#[from] SessionError),
}
