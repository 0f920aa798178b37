//! Session configuration.

use std::time::Duration;

/// When buffered operations are sent to the tablet servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Every operation is sent on its own as soon as it is applied. The
    /// future returned from `apply` completes when the server has responded.
    #[default]
    AutoFlushSync,

    /// Operations accumulate in the session's buffers and are flushed in the
    /// background: when a buffer fills, or when the flush interval elapses.
    /// Row errors surface through the session's error collector.
    AutoFlushBackground,

    /// Operations accumulate until the application calls `flush`.
    ManualFlush,
}

/// The consistency contract between this session's writes and subsequent
/// reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalConsistencyMode {
    /// The client forwards the last observed write timestamp with each
    /// operation, serializing its own reads after its writes.
    #[default]
    ClientPropagated,

    /// The server delays the write until consistency is guaranteed by
    /// clock bounds alone.
    CommitWait,
}

/// The tunable knobs of a session. Guarded by the session monitor; setters
/// are rejected while operations are pending.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub flush_mode: FlushMode,
    pub consistency_mode: ExternalConsistencyMode,
    /// Maximum operations per buffer.
    pub mutation_buffer_space: usize,
    pub low_watermark_percentage: f32,
    /// `low_watermark_percentage * mutation_buffer_space`, kept in sync by
    /// the setters.
    pub low_watermark: usize,
    pub flush_interval: Duration,
    /// Per-operation (sync mode) or per-batch (buffered modes) deadline.
    /// Zero means no deadline is attached at this layer.
    pub timeout: Duration,
    pub ignore_duplicate_rows: bool,
}

pub(crate) const DEFAULT_MUTATION_BUFFER_SPACE: usize = 1000;
pub(crate) const DEFAULT_LOW_WATERMARK_PERCENTAGE: f32 = 0.5;
pub(crate) const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

impl SessionConfig {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            flush_mode: FlushMode::default(),
            consistency_mode: ExternalConsistencyMode::default(),
            mutation_buffer_space: DEFAULT_MUTATION_BUFFER_SPACE,
            low_watermark_percentage: DEFAULT_LOW_WATERMARK_PERCENTAGE,
            low_watermark: (DEFAULT_LOW_WATERMARK_PERCENTAGE
                * DEFAULT_MUTATION_BUFFER_SPACE as f32) as usize,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            timeout,
            ignore_duplicate_rows: false,
        }
    }

    pub(crate) fn recompute_low_watermark(&mut self) {
        self.low_watermark =
            (self.low_watermark_percentage * self.mutation_buffer_space as f32) as usize;
    }

    /// The deadline attached to RPCs and lookups, if any.
    pub(crate) fn deadline(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}
