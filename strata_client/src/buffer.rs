//! The session's double buffers.
//!
//! A buffer cycles through three states: *inactive* (empty, waiting in the
//! inactive queue), *active* (accepting operations), and *flushing* (no new
//! operations, RPCs in flight). Each cycle is one generation; the buffer's
//! flush notification fires exactly once per generation, when that
//! generation's flush has fully completed.

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::operation::WriteOperation;
use crate::response::OperationResponse;
use crate::router::{LocatedTablet, LookupError};
use crate::session::OperationJoin;

/// Identity of a scheduled background flush task. A timer acts only if the
/// buffer still stores the identity it was scheduled with; a buffer that
/// was manually flushed (and possibly re-activated) in the meantime stores
/// a different one, and the stale timer becomes a no-op.
pub(crate) type FlusherTaskId = u64;

/// Which of the session's two buffer slots a buffer occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferId {
    A,
    B,
}

impl BufferId {
    pub(crate) fn idx(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Completes when a buffer generation's flush (or, for the session-level
/// instance, *some* buffer's flush) has finished.
///
/// Cloneable and awaitable by any number of waiters; fires exactly once.
#[derive(Debug, Clone)]
pub struct FlushNotification {
    rx: watch::Receiver<bool>,
}

impl FlushNotification {
    /// Whether the flush has already completed.
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the flush to complete. Returns immediately if it already
    /// has. A session dropped mid-flush counts as completion.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

/// Create the sender and waiter for one flush generation.
pub(crate) fn notification_channel(fired: bool) -> (watch::Sender<bool>, FlushNotification) {
    let (tx, rx) = watch::channel(fired);
    (tx, FlushNotification { rx })
}

/// One buffered operation: the operation itself, its in-flight tablet
/// lookup (spawned when the operation was applied), and the one-shot slot
/// its response is delivered through.
#[derive(Debug)]
pub(crate) struct BufferedOperation {
    pub(crate) op: WriteOperation,
    pub(crate) lookup: JoinHandle<Result<LocatedTablet, LookupError>>,
    pub(crate) completion: oneshot::Sender<Result<OperationResponse, crate::SessionError>>,
}

impl BufferedOperation {
    pub(crate) fn new(
        op: WriteOperation,
        lookup: JoinHandle<Result<LocatedTablet, LookupError>>,
    ) -> (Self, OperationJoin) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                op,
                lookup,
                completion,
            },
            OperationJoin::new(rx),
        )
    }
}

/// One buffer slot. All fields are guarded by the session monitor.
#[derive(Debug)]
pub(crate) struct Buffer {
    ops: Vec<BufferedOperation>,
    flusher_task: Option<FlusherTaskId>,
    notify_tx: watch::Sender<bool>,
    notification: FlushNotification,
}

impl Buffer {
    /// A new buffer in the inactive state: empty, with an already-fired
    /// notification.
    pub(crate) fn new() -> Self {
        let (notify_tx, notification) = notification_channel(true);
        Self {
            ops: Vec::new(),
            flusher_task: None,
            notify_tx,
            notification,
        }
    }

    /// Reset for a new generation. Called when the buffer is promoted from
    /// inactive to active.
    pub(crate) fn reset(&mut self) {
        trace!("buffer reset");
        self.ops = Vec::new();
        self.flusher_task = None;
        let (notify_tx, notification) = notification_channel(false);
        self.notify_tx = notify_tx;
        self.notification = notification;
    }

    pub(crate) fn ops(&self) -> &[BufferedOperation] {
        &self.ops
    }

    pub(crate) fn push(&mut self, op: BufferedOperation) {
        self.ops.push(op);
    }

    pub(crate) fn take_ops(&mut self) -> Vec<BufferedOperation> {
        std::mem::take(&mut self.ops)
    }

    /// The notification for the current generation. Already complete while
    /// the buffer is inactive.
    pub(crate) fn notification(&self) -> FlushNotification {
        self.notification.clone()
    }

    /// Complete this generation's notification. Called once the flush has
    /// fully completed.
    pub(crate) fn fire_notification(&self) {
        trace!("buffer flush notification fired");
        self.notify_tx.send_replace(true);
    }

    pub(crate) fn flusher_task(&self) -> Option<FlusherTaskId> {
        self.flusher_task
    }

    pub(crate) fn set_flusher_task(&mut self, id: FlusherTaskId) {
        self.flusher_task = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notification_lifecycle() {
        let mut buffer = Buffer::new();

        // Inactive buffers hand out already-complete notifications.
        assert!(buffer.notification().is_complete());
        buffer.notification().wait().await;

        // Promotion installs a fresh, unfired notification.
        buffer.reset();
        let pending = buffer.notification();
        assert!(!pending.is_complete());

        buffer.fire_notification();
        assert!(pending.is_complete());
        pending.wait().await;

        // Firing is idempotent within a generation; waiters never hang.
        buffer.fire_notification();
        assert!(buffer.notification().is_complete());
    }

    #[tokio::test]
    async fn test_reset_clears_task_identity() {
        let mut buffer = Buffer::new();
        buffer.set_flusher_task(7);
        assert_eq!(buffer.flusher_task(), Some(7));

        buffer.reset();
        assert_eq!(buffer.flusher_task(), None);
        assert!(buffer.ops().is_empty());
    }
}
