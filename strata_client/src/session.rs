//! The write session state machine.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::batch::{Batch, BatchContext};
use crate::buffer::{
    notification_channel, Buffer, BufferId, BufferedOperation, FlushNotification, FlusherTaskId,
};
use crate::config::{ExternalConsistencyMode, FlushMode, SessionConfig};
use crate::error::{ApplyError, SessionError};
use crate::error_collector::ErrorCollector;
use crate::operation::WriteOperation;
use crate::response::{OperationResponse, PendingErrors, RowError, RowErrorCode};
use crate::router::{LocatedTablet, LookupError, TabletLocator};
use crate::rpc::WriteRpc;
use crate::statistics::Statistics;
use data_types::TableId;

/// Completion handle for one applied operation. Resolves once the server
/// (or the session, for client-side failures) has produced the operation's
/// [`OperationResponse`].
#[derive(Debug)]
pub struct OperationJoin {
    rx: oneshot::Receiver<Result<OperationResponse, SessionError>>,
}

impl OperationJoin {
    pub(crate) fn new(rx: oneshot::Receiver<Result<OperationResponse, SessionError>>) -> Self {
        Self { rx }
    }
}

impl Future for OperationJoin {
    type Output = Result<OperationResponse, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(inner) => inner,
            Err(_) => Err(SessionError::Cancelled),
        })
    }
}

/// Completion handle for a flush: resolves with the responses of every
/// operation that was buffered at the time of the call, in apply order.
pub struct FlushJoin {
    inner: BoxFuture<'static, Result<Vec<OperationResponse>, SessionError>>,
}

impl FlushJoin {
    fn new(
        fut: impl Future<Output = Result<Vec<OperationResponse>, SessionError>> + Send + 'static,
    ) -> Self {
        Self { inner: fut.boxed() }
    }
}

impl Future for FlushJoin {
    type Output = Result<Vec<OperationResponse>, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for FlushJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushJoin").finish_non_exhaustive()
    }
}

/// A buffer detached from the active slot, owned by exactly one flush.
#[derive(Debug)]
struct DetachedBuffer {
    id: BufferId,
    ops: Vec<BufferedOperation>,
}

/// State guarded by the session monitor.
///
/// The session is not thread-safe from the application's perspective, but
/// flush timers and I/O completions touch this state concurrently with the
/// caller, so one mutex protects all of it.
#[derive(Debug)]
struct State {
    config: SessionConfig,
    buffers: [Buffer; 2],
    active: Option<BufferId>,
    /// Flushed, empty buffers awaiting promotion. At most two entries.
    inactive: VecDeque<BufferId>,
    /// Session-level notification, completed and replaced every time some
    /// buffer finishes flushing. Handed to throttled callers.
    notify_tx: watch::Sender<bool>,
    notification: FlushNotification,
    next_flusher_task: FlusherTaskId,
    rng: StdRng,
}

impl State {
    fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.idx()]
    }

    fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.idx()]
    }

    fn inactive_available(&self) -> bool {
        !self.inactive.is_empty()
    }

    /// Promote an inactive buffer to active, resetting it for a new
    /// generation. Returns false if none is available.
    fn promote_inactive(&mut self) -> bool {
        debug_assert!(self.active.is_none());
        match self.inactive.pop_front() {
            Some(id) => {
                self.buffer_mut(id).reset();
                self.active = Some(id);
                true
            }
            None => false,
        }
    }

    fn detach_active(&mut self) -> Option<DetachedBuffer> {
        self.active.take().map(|id| DetachedBuffer {
            id,
            ops: self.buffer_mut(id).take_ops(),
        })
    }

    /// The flush notifications of every buffer except the active one. Used
    /// by `flush` to wait out generations already in flight.
    fn non_active_notifications(&self) -> Vec<FlushNotification> {
        [BufferId::A, BufferId::B]
            .into_iter()
            .filter(|id| self.active != Some(*id))
            .map(|id| self.buffer(id).notification())
            .collect()
    }

    fn has_pending_operations(&self) -> bool {
        match self.active {
            None => self.inactive.len() < 2,
            Some(id) => !self.buffer(id).ops().is_empty() || !self.inactive_available(),
        }
    }

    /// Install a fresh session-level notification, returning the previous
    /// sender so the caller can fire it outside the monitor.
    fn swap_session_notification(&mut self) -> watch::Sender<bool> {
        let (tx, notification) = notification_channel(false);
        self.notification = notification;
        std::mem::replace(&mut self.notify_tx, tx)
    }
}

#[derive(Debug)]
struct SessionInner {
    rpc: Arc<dyn WriteRpc>,
    locator: Arc<dyn TabletLocator>,
    collector: Arc<ErrorCollector>,
    statistics: Statistics,
    state: Mutex<State>,
    closed: AtomicBool,
}

/// A context for writing to the cluster.
///
/// See the [crate docs](crate) for the buffering model and ordering
/// contract. Must be used from within a tokio runtime: tablet lookups,
/// background flushes, and flush timers all run as spawned tasks.
#[derive(Debug)]
pub struct WriteSession {
    inner: Arc<SessionInner>,
}

impl WriteSession {
    /// Open a session writing through `rpc` and resolving tablets through
    /// `locator`. The session's timeout starts at the transport's default
    /// operation timeout.
    pub fn new(rpc: Arc<dyn WriteRpc>, locator: Arc<dyn TabletLocator>) -> Self {
        let config = SessionConfig::new(rpc.default_operation_timeout());
        let collector = Arc::new(ErrorCollector::new(config.mutation_buffer_space));
        let (notify_tx, notification) = notification_channel(false);

        Self {
            inner: Arc::new(SessionInner {
                rpc,
                locator,
                collector,
                statistics: Statistics::new(),
                state: Mutex::new(State {
                    config,
                    buffers: [Buffer::new(), Buffer::new()],
                    active: None,
                    inactive: VecDeque::from([BufferId::A, BufferId::B]),
                    notify_tx,
                    notification,
                    next_flusher_task: 0,
                    rng: StdRng::from_entropy(),
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Apply one operation.
    ///
    /// In [`FlushMode::AutoFlushSync`] the operation is dispatched
    /// immediately and the returned handle resolves with the server's
    /// response. In the buffered modes the operation joins the active
    /// buffer (its tablet lookup starting right away) and the handle
    /// resolves when the buffer's flush completes.
    ///
    /// On [`ApplyError::Throttled`] and [`ApplyError::BufferFull`] the
    /// operation is handed back untouched: not frozen, not buffered.
    pub fn apply(&self, op: WriteOperation) -> Result<OperationJoin, ApplyError> {
        let partition_key = op.partition_key().map_err(SessionError::from)?;

        let (flush_mode, deadline) = {
            let state = self.inner.state.lock();
            (state.config.flush_mode, state.config.deadline())
        };

        if flush_mode == FlushMode::AutoFlushSync {
            return Ok(self.apply_sync(op, partition_key));
        }

        // Kick off the tablet lookup before taking the monitor so that
        // resolution overlaps with buffering.
        let lookup = self
            .inner
            .spawn_lookup(op.table().id().clone(), partition_key, deadline);

        let mut to_flush = None;
        let result = self.admit(op, lookup, &mut to_flush);

        // Flush a detached buffer outside the monitor. This happens even
        // when admission failed: filling up and throttling can occur on
        // the same call.
        if let Some(detached) = to_flush {
            let _ = Arc::clone(&self.inner).spawn_flush(detached);
        }
        result
    }

    /// Buffered-mode admission. Runs entirely under the session monitor.
    fn admit(
        &self,
        mut op: WriteOperation,
        lookup: JoinHandle<Result<LocatedTablet, LookupError>>,
        to_flush: &mut Option<DetachedBuffer>,
    ) -> Result<OperationJoin, ApplyError> {
        let mut state = self.inner.state.lock();

        if state.active.is_none() && !state.promote_inactive() {
            // The application wrote into one buffer, flushed, wrote into
            // the second, flushed again, and immediately applied another
            // operation.
            lookup.abort();
            return Err(ApplyError::Throttled {
                op: Box::new(op),
                notification: state.notification.clone(),
            });
        }
        let mut active = state.active.expect("an active buffer was just ensured");

        match state.config.flush_mode {
            FlushMode::ManualFlush => {
                if state.buffer(active).ops().len() >= state.config.mutation_buffer_space {
                    lookup.abort();
                    return Err(ApplyError::BufferFull { op: Box::new(op) });
                }
                op.freeze();
                let (buffered, join) = BufferedOperation::new(op, lookup);
                state.buffer_mut(active).push(buffered);
                Ok(join)
            }
            FlushMode::AutoFlushBackground => {
                let space = state.config.mutation_buffer_space;
                let low_watermark = state.config.low_watermark;
                let mut active_size = state.buffer(active).ops().len();

                if active_size >= space {
                    // Detach the full buffer; the caller flushes it once
                    // the monitor is released, admitted or not.
                    *to_flush = state.detach_active();
                    if !state.promote_inactive() {
                        lookup.abort();
                        return Err(ApplyError::Throttled {
                            op: Box::new(op),
                            notification: state.notification.clone(),
                        });
                    }
                    active = state.active.expect("an inactive buffer was promoted");
                    active_size = 0;
                }

                if low_watermark < space
                    && active_size >= low_watermark
                    && !state.inactive_available()
                {
                    // Shed load probabilistically between the watermark
                    // and the hard limit, smoothing bursty producers
                    // toward the flush rate.
                    let draw = state.rng.gen_range(0..space - low_watermark);
                    if active_size + 1 + draw > space {
                        lookup.abort();
                        return Err(ApplyError::Throttled {
                            op: Box::new(op),
                            notification: state.notification.clone(),
                        });
                    }
                }

                op.freeze();
                let (buffered, join) = BufferedOperation::new(op, lookup);
                state.buffer_mut(active).push(buffered);

                if active_size + 1 >= space && state.inactive_available() {
                    // The operation filled the buffer.
                    debug_assert!(to_flush.is_none());
                    *to_flush = state.detach_active();
                } else if active_size == 0 {
                    // First operation in this buffer generation: arm the
                    // background flush timer.
                    let task_id = state.next_flusher_task;
                    state.next_flusher_task += 1;
                    state.buffer_mut(active).set_flusher_task(task_id);
                    self.inner
                        .schedule_flush(task_id, state.config.flush_interval);
                }
                Ok(join)
            }
            FlushMode::AutoFlushSync => unreachable!("sync mode does not buffer"),
        }
    }

    /// Immediate dispatch for [`FlushMode::AutoFlushSync`].
    fn apply_sync(&self, mut op: WriteOperation, partition_key: Vec<u8>) -> OperationJoin {
        let (consistency_mode, deadline, ignore_duplicate_rows) = {
            let state = self.inner.state.lock();
            (
                state.config.consistency_mode,
                state.config.deadline(),
                state.config.ignore_duplicate_rows,
            )
        };

        op.freeze();
        let (completion, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let located = inner
                .locator
                .locate_tablet(op.table().id(), &partition_key, deadline)
                .await;
            match located {
                Ok(tablet) => {
                    let mut batch =
                        Batch::new(Arc::clone(op.table()), tablet, ignore_duplicate_rows);
                    batch.push(0, op, completion);
                    let ctx = inner.batch_context(consistency_mode, deadline, false);
                    let _ = batch.execute(&ctx).await;
                }
                Err(e) => {
                    // Sync-mode failures surface on the join handle only;
                    // the error collector serves background flushes.
                    let error = lookup_row_error(&e, &op);
                    let _ = completion.send(Ok(OperationResponse::failed(error)));
                }
            }
        });
        OperationJoin::new(rx)
    }

    /// Flush all buffered operations.
    ///
    /// Returns immediately; the handle resolves once every operation
    /// buffered at the time of the call has completed, including those in
    /// a previous buffer still in flight.
    pub fn flush(&self) -> FlushJoin {
        let (non_active, detached) = {
            let mut state = self.inner.state.lock();
            (state.non_active_notifications(), state.detach_active())
        };

        // Start the active buffer's flush right away; completion of this
        // call additionally awaits the non-active generations.
        let active_rx = detached.map(|d| Arc::clone(&self.inner).spawn_flush(d));

        FlushJoin::new(async move {
            for notification in non_active {
                notification.wait().await;
            }
            match active_rx {
                Some(rx) => rx.await.map_err(|_| SessionError::Cancelled),
                None => Ok(Vec::new()),
            }
        })
    }

    /// Flush and mark the session closed. Idempotent; closing an already
    /// closed session just flushes whatever is buffered (normally
    /// nothing).
    pub fn close(&self) -> FlushJoin {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("closing write session");
        }
        self.flush()
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether any operation is buffered or in flight.
    pub fn has_pending_operations(&self) -> bool {
        self.inner.state.lock().has_pending_operations()
    }

    /// Number of row errors the collector currently holds.
    pub fn count_pending_errors(&self) -> usize {
        self.inner.collector.count()
    }

    /// Drain the collected row errors.
    pub fn get_pending_errors(&self) -> PendingErrors {
        self.inner.collector.take_all()
    }

    /// Per-tablet write statistics for this session.
    pub fn statistics(&self) -> Statistics {
        self.inner.statistics.clone()
    }

    /// The session's flush mode.
    pub fn flush_mode(&self) -> FlushMode {
        self.inner.state.lock().config.flush_mode
    }

    /// Change the flush mode. Fails while operations are pending.
    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<(), SessionError> {
        self.update_config(|config| config.flush_mode = mode)
    }

    /// The session's external consistency mode.
    pub fn external_consistency_mode(&self) -> ExternalConsistencyMode {
        self.inner.state.lock().config.consistency_mode
    }

    /// Change the consistency mode. Fails while operations are pending.
    pub fn set_external_consistency_mode(
        &self,
        mode: ExternalConsistencyMode,
    ) -> Result<(), SessionError> {
        self.update_config(|config| config.consistency_mode = mode)
    }

    /// Maximum number of operations per buffer.
    pub fn mutation_buffer_space(&self) -> usize {
        self.inner.state.lock().config.mutation_buffer_space
    }

    /// Resize the buffers. Fails while operations are pending.
    pub fn set_mutation_buffer_space(&self, size: usize) -> Result<(), SessionError> {
        self.update_config(|config| {
            config.mutation_buffer_space = size;
            config.recompute_low_watermark();
        })
    }

    /// The low-watermark fraction of the buffer at which probabilistic
    /// backpressure starts.
    pub fn mutation_buffer_low_watermark(&self) -> f32 {
        self.inner.state.lock().config.low_watermark_percentage
    }

    /// Change the low watermark. Fails while operations are pending or if
    /// `percentage` is outside `[0.0, 1.0]`.
    pub fn set_mutation_buffer_low_watermark(&self, percentage: f32) -> Result<(), SessionError> {
        if !(0.0..=1.0).contains(&percentage) {
            return Err(SessionError::InvalidLowWatermark { given: percentage });
        }
        self.update_config(|config| {
            config.low_watermark_percentage = percentage;
            config.recompute_low_watermark();
        })
    }

    /// The background flush interval.
    pub fn flush_interval(&self) -> Duration {
        self.inner.state.lock().config.flush_interval
    }

    /// Change the background flush interval; applies to buffers activated
    /// from now on.
    pub fn set_flush_interval(&self, interval: Duration) {
        self.inner.state.lock().config.flush_interval = interval;
    }

    /// The operation (sync mode) or batch (buffered modes) timeout. Zero
    /// means no deadline is attached at this layer.
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().config.timeout
    }

    /// Change the timeout; applies to operations applied from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.state.lock().config.timeout = timeout;
    }

    /// Whether duplicate-key errors are silently dropped.
    pub fn ignore_duplicate_rows(&self) -> bool {
        self.inner.state.lock().config.ignore_duplicate_rows
    }

    /// Drop AlreadyPresent row errors instead of reporting them.
    pub fn set_ignore_duplicate_rows(&self, ignore: bool) {
        self.inner.state.lock().config.ignore_duplicate_rows = ignore;
    }

    /// Seed the probabilistic-backpressure RNG, for deterministic tests.
    #[doc(hidden)]
    pub fn set_random_seed(&self, seed: u64) {
        self.inner.state.lock().rng = StdRng::seed_from_u64(seed);
    }

    fn update_config(&self, f: impl FnOnce(&mut SessionConfig)) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        if state.has_pending_operations() {
            return Err(SessionError::PendingOperations);
        }
        f(&mut state.config);
        Ok(())
    }
}

impl SessionInner {
    fn spawn_lookup(
        &self,
        table: TableId,
        partition_key: Vec<u8>,
        deadline: Option<Duration>,
    ) -> JoinHandle<Result<LocatedTablet, LookupError>> {
        let locator = Arc::clone(&self.locator);
        tokio::spawn(async move {
            locator
                .locate_tablet(&table, &partition_key, deadline)
                .await
        })
    }

    fn batch_context(
        &self,
        consistency_mode: ExternalConsistencyMode,
        deadline: Option<Duration>,
        collect_errors: bool,
    ) -> BatchContext {
        BatchContext {
            rpc: Arc::clone(&self.rpc),
            collector: Arc::clone(&self.collector),
            statistics: self.statistics.clone(),
            consistency_mode,
            deadline,
            collect_errors,
        }
    }

    /// Start flushing a detached buffer. The returned receiver resolves
    /// with the buffer's responses after the buffer has been recycled and
    /// its flush notification fired.
    fn spawn_flush(
        self: Arc<Self>,
        detached: DetachedBuffer,
    ) -> oneshot::Receiver<Vec<OperationResponse>> {
        debug!(ops = detached.ops.len(), "flushing buffer");
        let (tx, rx) = oneshot::channel();

        if detached.ops.is_empty() {
            // Nothing to send; recycle the generation immediately.
            self.queue_buffer(detached.id);
            let _ = tx.send(Vec::new());
            return rx;
        }

        tokio::spawn(async move {
            let responses = self.run_flush(detached.ops).await;
            self.queue_buffer(detached.id);
            let _ = tx.send(responses);
        });
        rx
    }

    /// Wait for every pending tablet lookup, group by tablet, dispatch all
    /// batches, and reassemble the responses in apply order.
    async fn run_flush(&self, ops: Vec<BufferedOperation>) -> Vec<OperationResponse> {
        let (consistency_mode, deadline, collect_errors, ignore_duplicate_rows) = {
            let state = self.state.lock();
            (
                state.config.consistency_mode,
                state.config.deadline(),
                state.config.flush_mode == FlushMode::AutoFlushBackground,
                state.config.ignore_duplicate_rows,
            )
        };

        let mut responses: Vec<Option<OperationResponse>> = vec![None; ops.len()];
        let mut batches: HashMap<data_types::TabletId, Batch> = HashMap::new();

        for (index, buffered) in ops.into_iter().enumerate() {
            let BufferedOperation {
                op,
                lookup,
                completion,
            } = buffered;

            let located = match lookup.await {
                Ok(result) => result,
                Err(e) => Err(LookupError::Transport {
                    message: format!("tablet lookup task failed: {e}"),
                }),
            };

            match located {
                Ok(tablet) => {
                    let table = Arc::clone(op.table());
                    let batch = batches
                        .entry(tablet.tablet_id.clone())
                        .or_insert_with(|| Batch::new(table, tablet, ignore_duplicate_rows));
                    batch.push(index, op, completion);
                }
                Err(e) => {
                    // Failed lookups never make it into a batch; complete
                    // the operation with a synthesized row error now.
                    let error = lookup_row_error(&e, &op);
                    if collect_errors {
                        self.collector.add(error.clone());
                    }
                    let response = OperationResponse::failed(error);
                    let _ = completion.send(Ok(response.clone()));
                    responses[index] = Some(response);
                }
            }
        }

        let ctx = self.batch_context(consistency_mode, deadline, collect_errors);
        let mut in_flight: FuturesUnordered<_> =
            batches.into_values().map(|b| b.execute(&ctx)).collect();
        while let Some(batch_responses) = in_flight.next().await {
            for (index, response) in batch_responses {
                responses[index] = Some(response);
            }
        }

        responses.into_iter().flatten().collect()
    }

    /// Return a buffer to the inactive queue after its flush completed,
    /// firing its generation notification and the session-level one.
    fn queue_buffer(&self, id: BufferId) {
        let old_notify = {
            let mut state = self.state.lock();
            state.buffer(id).fire_notification();
            state.inactive.push_back(id);
            state.swap_session_notification()
        };
        old_notify.send_replace(true);
    }

    /// Arm the background flush timer for the buffer generation that
    /// stored `task_id`. On firing, the timer flushes the active buffer
    /// only if it still stores the same identity; a generation that was
    /// flushed (manually or by filling up) in the meantime stores a
    /// different one, and the stale timer does nothing.
    fn schedule_flush(self: &Arc<Self>, task_id: FlusherTaskId, interval: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            let detached = {
                let mut state = inner.state.lock();
                match state.active {
                    Some(id) if state.buffer(id).flusher_task() == Some(task_id) => {
                        state.detach_active()
                    }
                    _ => {
                        trace!(task_id, "stale flusher task, skipping");
                        None
                    }
                }
            };

            if let Some(detached) = detached {
                let _ = Arc::clone(&inner).spawn_flush(detached);
            }
        });
    }
}

fn lookup_row_error(error: &LookupError, op: &WriteOperation) -> RowError {
    match error {
        LookupError::NonCoveredRange { .. } => {
            // TODO: surface a dedicated code so applications can tell
            // non-covered writes from updates of missing rows.
            RowError::new(RowErrorCode::NotFound, error.to_string(), op)
        }
        other => {
            warn!(%op, error = %other, "unexpected tablet lookup failure");
            RowError::new(RowErrorCode::RuntimeError, other.to_string(), op)
        }
    }
}
