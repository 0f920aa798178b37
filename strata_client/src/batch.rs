//! Per-tablet operation batches.
//!
//! During a flush, the operations of one buffer are grouped by destination
//! tablet; each group becomes one [`Batch`], one write RPC, and one
//! fan-out of per-row responses back to the individual operations.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use row_ops::codec::encode_operations;
use tokio::sync::oneshot;
use tracing::trace;

use crate::config::ExternalConsistencyMode;
use crate::error_collector::ErrorCollector;
use crate::operation::{Table, WriteOperation};
use crate::response::{OperationResponse, RowError, RowErrorCode};
use crate::router::LocatedTablet;
use crate::rpc::{WriteRequest, WriteRpc};
use crate::statistics::{Statistic, Statistics};
use crate::SessionError;

/// Everything a batch needs from its session to execute.
#[derive(Debug)]
pub(crate) struct BatchContext {
    pub rpc: Arc<dyn WriteRpc>,
    pub collector: Arc<ErrorCollector>,
    pub statistics: Statistics,
    pub consistency_mode: ExternalConsistencyMode,
    /// Captured at flush time; `None` means no deadline at this layer.
    pub deadline: Option<Duration>,
    /// Whether row errors also go to the error collector (background
    /// flush mode).
    pub collect_errors: bool,
}

/// One operation inside a batch, remembering its submission index so the
/// flush-wide response list can be reassembled in apply order.
#[derive(Debug)]
struct BatchEntry {
    index: usize,
    op: WriteOperation,
    completion: oneshot::Sender<Result<OperationResponse, SessionError>>,
}

/// The operations of one flush bound for one tablet.
#[derive(Debug)]
pub(crate) struct Batch {
    table: Arc<Table>,
    tablet: LocatedTablet,
    /// Captured at batch creation; later configuration changes do not
    /// affect in-flight batches.
    ignore_duplicate_rows: bool,
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub(crate) fn new(
        table: Arc<Table>,
        tablet: LocatedTablet,
        ignore_duplicate_rows: bool,
    ) -> Self {
        Self {
            table,
            tablet,
            ignore_duplicate_rows,
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(
        &mut self,
        index: usize,
        op: WriteOperation,
        completion: oneshot::Sender<Result<OperationResponse, SessionError>>,
    ) {
        self.entries.push(BatchEntry {
            index,
            op,
            completion,
        });
    }

    /// Encode, send, and fan the response out to every operation. Always
    /// produces one response per operation; batch-level failures become
    /// synthesized per-row errors.
    pub(crate) async fn execute(self, ctx: &BatchContext) -> Vec<(usize, OperationResponse)> {
        let start = tokio::time::Instant::now();

        let encode_result = {
            let ops: Vec<_> = self
                .entries
                .iter()
                .map(|entry| (entry.op.change_type(), entry.op.row()))
                .collect::<Vec<_>>();
            encode_operations(&ops)
        };
        let row_operations = match encode_result {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return Vec::new(),
            Err(e) => {
                // A row that cannot be encoded fails the whole batch
                // client-side, without an RPC.
                let message = e.to_string();
                return self.fail_all(ctx, RowErrorCode::RuntimeError, &message);
            }
        };

        let payload_bytes = row_operations.total_size() as u64;
        let request = WriteRequest {
            table_id: self.table.id().clone(),
            tablet_id: self.tablet.tablet_id.clone(),
            schema: self.table.schema().clone(),
            row_operations,
            external_consistency_mode: ctx.consistency_mode,
            propagated_timestamp: ctx.rpc.last_propagated_timestamp(),
            deadline: ctx.deadline,
        };

        trace!(
            tablet_id = %self.tablet.tablet_id,
            rows = self.entries.len(),
            "sending write RPC"
        );
        match ctx.rpc.send(request).await {
            Ok(response) => self.fan_out(ctx, response, start, payload_bytes),
            Err(e) => {
                let message = e.to_string();
                self.fail_all(ctx, e.row_error_code(), &message)
            }
        }
    }

    /// Deliver a successful write response to each operation in the batch.
    fn fan_out(
        self,
        ctx: &BatchContext,
        response: crate::rpc::WriteResponse,
        start: tokio::time::Instant,
        payload_bytes: u64,
    ) -> Vec<(usize, OperationResponse)> {
        trace!(rows = self.entries.len(), "got write response");

        if response.write_timestamp > 0 {
            ctx.rpc
                .update_last_propagated_timestamp(response.write_timestamp);
        }

        let elapsed_millis = start.elapsed().as_millis() as u64;
        let row_errors: HashMap<u32, &crate::rpc::PerRowError> = response
            .per_row_errors
            .iter()
            .map(|e| (e.row_index, e))
            .collect();

        let Self {
            table,
            tablet,
            ignore_duplicate_rows,
            entries,
        } = self;
        let stats = ctx.statistics.tablet(table.name(), &tablet.tablet_id);
        stats.increment(Statistic::WriteRpcs, 1);
        stats.increment(Statistic::BytesWritten, payload_bytes);

        let mut out = Vec::with_capacity(entries.len());
        for (row_index, entry) in entries.into_iter().enumerate() {
            let row_error = row_errors.get(&(row_index as u32)).and_then(|e| {
                if ignore_duplicate_rows && e.code == RowErrorCode::AlreadyPresent {
                    return None;
                }
                Some(RowError::new(e.code, e.message.clone(), &entry.op))
            });

            match &row_error {
                Some(error) => {
                    stats.increment(Statistic::OpsErrors, 1);
                    // Collect before completing, so the error is visible to
                    // a completion handler that interrogates the collector.
                    if ctx.collect_errors {
                        ctx.collector.add(error.clone());
                    }
                }
                None => stats.increment(Statistic::WriteOps, 1),
            }

            let op_response = OperationResponse::new(
                response.write_timestamp,
                elapsed_millis,
                Some(response.tserver_uuid.clone()),
                row_error,
            );
            let _ = entry.completion.send(Ok(op_response.clone()));
            out.push((entry.index, op_response));
        }
        out
    }

    /// The whole batch failed: synthesize one error-bearing response per
    /// operation.
    fn fail_all(
        self,
        ctx: &BatchContext,
        code: RowErrorCode,
        message: &str,
    ) -> Vec<(usize, OperationResponse)> {
        let Self {
            table,
            tablet,
            entries,
            ..
        } = self;
        let stats = ctx.statistics.tablet(table.name(), &tablet.tablet_id);
        stats.increment(Statistic::RpcErrors, 1);

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            stats.increment(Statistic::OpsErrors, 1);
            let error = RowError::new(code, message, &entry.op);
            if ctx.collect_errors {
                ctx.collector.add(error.clone());
            }
            let response = OperationResponse::failed(error);
            let _ = entry.completion.send(Ok(response.clone()));
            out.push((entry.index, response));
        }
        out
    }
}
