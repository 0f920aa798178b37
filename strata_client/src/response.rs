//! Per-operation responses and row errors.

use std::fmt;

use row_ops::{ChangeType, PartialRow};

use crate::operation::WriteOperation;

/// The error codes a tablet server attaches to individual rows, plus the
/// codes the session synthesizes for failures it detects itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RowErrorCode {
    /// Duplicate primary key on INSERT.
    AlreadyPresent,
    /// The row (or a tablet covering it) does not exist.
    NotFound,
    InvalidArgument,
    TimedOut,
    Unavailable,
    RuntimeError,
}

impl fmt::Display for RowErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AlreadyPresent => "already present",
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
            Self::TimedOut => "timed out",
            Self::Unavailable => "unavailable",
            Self::RuntimeError => "runtime error",
        };
        f.write_str(name)
    }
}

/// The operation a [`RowError`] refers to: enough to identify and reproduce
/// the failed write. The row is frozen but fully readable.
#[derive(Debug, Clone)]
pub struct FailedOperation {
    /// Name of the destination table.
    pub table_name: String,
    /// The kind of change that failed.
    pub change_type: ChangeType,
    /// The row as submitted.
    pub row: PartialRow,
}

impl From<&WriteOperation> for FailedOperation {
    fn from(op: &WriteOperation) -> Self {
        Self {
            table_name: op.table().name().to_owned(),
            change_type: op.change_type(),
            row: op.row().clone(),
        }
    }
}

/// An error scoped to a single row.
#[derive(Debug, Clone)]
pub struct RowError {
    /// What went wrong.
    pub code: RowErrorCode,
    /// Server- or session-provided detail.
    pub message: String,
    /// The operation that failed.
    pub op: FailedOperation,
}

impl RowError {
    pub(crate) fn new(code: RowErrorCode, message: impl Into<String>, op: &WriteOperation) -> Self {
        Self {
            code,
            message: message.into(),
            op: op.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row error ({}) on {:?} {} {}: {}",
            self.code, self.op.change_type, self.op.table_name, self.op.row, self.message
        )
    }
}

/// The outcome of one applied operation.
#[derive(Debug, Clone)]
pub struct OperationResponse {
    write_timestamp: u64,
    elapsed_millis: u64,
    tserver_uuid: Option<String>,
    row_error: Option<RowError>,
}

impl OperationResponse {
    pub(crate) fn new(
        write_timestamp: u64,
        elapsed_millis: u64,
        tserver_uuid: Option<String>,
        row_error: Option<RowError>,
    ) -> Self {
        Self {
            write_timestamp,
            elapsed_millis,
            tserver_uuid,
            row_error,
        }
    }

    pub(crate) fn failed(row_error: RowError) -> Self {
        Self::new(0, 0, None, Some(row_error))
    }

    /// The server-assigned timestamp of the write, or 0 when the write
    /// failed before being assigned one.
    pub fn write_timestamp(&self) -> u64 {
        self.write_timestamp
    }

    /// Wall-clock milliseconds between dispatch and response.
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed_millis
    }

    /// UUID of the tablet server that executed the write, when one did.
    pub fn tserver_uuid(&self) -> Option<&str> {
        self.tserver_uuid.as_deref()
    }

    /// Whether this operation failed with a row error.
    pub fn has_row_error(&self) -> bool {
        self.row_error.is_some()
    }

    /// The row error, if any.
    pub fn row_error(&self) -> Option<&RowError> {
        self.row_error.as_ref()
    }
}

/// Everything the error collector held at drain time.
#[derive(Debug)]
pub struct PendingErrors {
    /// The collected row errors, oldest first.
    pub errors: Vec<RowError>,
    /// Whether the collector dropped errors because it reached capacity
    /// since the last drain.
    pub overflowed: bool,
}
