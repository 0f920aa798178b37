//! The write RPC transport interface.
//!
//! The session does not speak the wire protocol itself: framing,
//! connection management, and retries all live behind [`WriteRpc`],
//! implemented by the surrounding client. The session builds one
//! [`WriteRequest`] per tablet per flush and interprets the
//! [`WriteResponse`] row by row.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{Schema, TabletId};
use row_ops::RowOperations;
use thiserror::Error;

use crate::config::ExternalConsistencyMode;
use crate::response::RowErrorCode;

/// The service method write requests are addressed to on tablet servers.
pub const WRITE_METHOD: &str = "Write";

/// Errors surfaced by the transport for a whole RPC.
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    /// The deadline elapsed before a response arrived.
    #[error("write RPC timed out")]
    TimedOut,

    /// The connection failed and the transport's retry policy gave up.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable detail.
        message: String,
    },

    /// The tablet server rejected the request as a whole.
    #[error("tablet server error ({code}): {message}")]
    TabletServer {
        /// The row-level code equivalent of the rejection.
        code: RowErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// A sidecar index past the end of the offset list.
    #[error("sidecar {idx} not valid, response has {count} sidecars")]
    SidecarIndex {
        /// The requested index.
        idx: usize,
        /// How many sidecars the response carries.
        count: usize,
    },

    /// A sidecar whose offsets fall outside the response payload.
    #[error("sidecar {idx} invalid (offset {offset}, length {length}, payload {payload_len})")]
    SidecarBounds {
        /// The requested index.
        idx: usize,
        /// Claimed start offset.
        offset: usize,
        /// Claimed length.
        length: usize,
        /// Actual payload size.
        payload_len: usize,
    },
}

impl RpcError {
    /// The row-level code used when synthesizing per-row errors out of a
    /// failed batch.
    pub(crate) fn row_error_code(&self) -> RowErrorCode {
        match self {
            Self::TimedOut => RowErrorCode::TimedOut,
            Self::Transport { .. } => RowErrorCode::Unavailable,
            Self::TabletServer { code, .. } => *code,
            Self::SidecarIndex { .. } | Self::SidecarBounds { .. } => RowErrorCode::RuntimeError,
        }
    }
}

/// One batched write bound for a single tablet.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// The destination table.
    pub table_id: data_types::TableId,
    /// The destination tablet; the transport routes to its leader replica.
    pub tablet_id: TabletId,
    /// Schema of the encoded rows.
    pub schema: Schema,
    /// The encoded row operations.
    pub row_operations: RowOperations,
    /// The session's consistency mode.
    pub external_consistency_mode: ExternalConsistencyMode,
    /// Last observed write timestamp, in client-propagated mode.
    pub propagated_timestamp: Option<u64>,
    /// Deadline for the RPC, when the session attaches one.
    pub deadline: Option<Duration>,
}

/// A row-scoped error inside an otherwise successful write response.
#[derive(Debug, Clone)]
pub struct PerRowError {
    /// Index of the failed row within the request's row operations.
    pub row_index: u32,
    /// The failure code.
    pub code: RowErrorCode,
    /// Server-provided detail.
    pub message: String,
}

/// Auxiliary byte blobs appended to a response frame after the main
/// message, addressed by an offset list in the response header.
///
/// Accessors return non-owning views into the response payload; their
/// lifetime is that of the underlying [`Bytes`] allocation.
#[derive(Debug, Clone, Default)]
pub struct Sidecars {
    data: Bytes,
    offsets: Vec<u32>,
}

impl Sidecars {
    /// Wrap a response payload and its sidecar offset list.
    pub fn new(data: Bytes, offsets: Vec<u32>) -> Self {
        Self { data, offsets }
    }

    /// Number of sidecars in the response.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the response carries no sidecars.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The sidecar at `idx`, as a zero-copy slice of the payload.
    ///
    /// Sidecar `idx` spans from its offset to the next sidecar's offset, or
    /// to the end of the payload for the last one.
    pub fn get(&self, idx: usize) -> Result<Bytes, RpcError> {
        if idx >= self.offsets.len() {
            return Err(RpcError::SidecarIndex {
                idx,
                count: self.offsets.len(),
            });
        }

        let offset = self.offsets[idx] as usize;
        let end = match self.offsets.get(idx + 1) {
            Some(next) => *next as usize,
            None => self.data.len(),
        };

        if offset > self.data.len() || end < offset || end > self.data.len() {
            return Err(RpcError::SidecarBounds {
                idx,
                offset,
                length: end.saturating_sub(offset),
                payload_len: self.data.len(),
            });
        }

        Ok(self.data.slice(offset..end))
    }
}

/// A successful write response for one tablet.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    /// The server-assigned timestamp for the batch; 0 when the server did
    /// not assign one.
    pub write_timestamp: u64,
    /// UUID of the responding tablet server.
    pub tserver_uuid: String,
    /// Errors for individual rows; rows not listed succeeded.
    pub per_row_errors: Vec<PerRowError>,
    /// Sidecars attached to the response frame.
    pub sidecars: Sidecars,
}

/// The write client of the RPC transport.
#[async_trait]
pub trait WriteRpc: std::fmt::Debug + Send + Sync + 'static {
    /// Send one batched write and await its response. The transport frames
    /// the request as a [`WRITE_METHOD`] call to the tablet's leader
    /// replica; retries below the deadline are its concern, and an `Err`
    /// here is terminal for the batch.
    async fn send(&self, request: WriteRequest) -> Result<WriteResponse, RpcError>;

    /// Record a server-observed write timestamp so that subsequent
    /// client-propagated reads see this write.
    fn update_last_propagated_timestamp(&self, timestamp: u64);

    /// The most recent propagated timestamp, if any write has been
    /// acknowledged yet.
    fn last_propagated_timestamp(&self) -> Option<u64>;

    /// The operation timeout sessions start out with.
    fn default_operation_timeout(&self) -> Duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_slicing() {
        let sidecars = Sidecars::new(Bytes::from_static(b"aaabbcccc"), vec![0, 3, 5]);
        assert_eq!(sidecars.len(), 3);
        assert_eq!(&sidecars.get(0).unwrap()[..], b"aaa");
        assert_eq!(&sidecars.get(1).unwrap()[..], b"bb");
        assert_eq!(&sidecars.get(2).unwrap()[..], b"cccc");
    }

    #[test]
    fn test_sidecar_index_bounds() {
        let sidecars = Sidecars::new(Bytes::from_static(b"xy"), vec![0, 1]);

        // Requesting index == len is out of bounds.
        assert_matches::assert_matches!(
            sidecars.get(2),
            Err(RpcError::SidecarIndex { idx: 2, count: 2 })
        );

        let empty = Sidecars::default();
        assert!(empty.is_empty());
        assert_matches::assert_matches!(
            empty.get(0),
            Err(RpcError::SidecarIndex { idx: 0, count: 0 })
        );
    }

    #[test]
    fn test_sidecar_invalid_offsets() {
        let sidecars = Sidecars::new(Bytes::from_static(b"abc"), vec![0, 10]);
        assert_matches::assert_matches!(sidecars.get(1), Err(RpcError::SidecarBounds { .. }));
        // The first sidecar's end offset is the (invalid) second offset.
        assert_matches::assert_matches!(sidecars.get(0), Err(RpcError::SidecarBounds { .. }));
    }
}
