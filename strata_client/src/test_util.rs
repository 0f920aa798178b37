//! Mock collaborators and fixtures for testing sessions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use data_types::{
    ColumnSchema, DataType, Partition, PartitionSchema, Schema, TableId, TabletId,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::operation::Table;
use crate::response::RowErrorCode;
use crate::router::{LocatedTablet, LookupError, ReplicaRole, TabletLocator, TabletReplica};
use crate::rpc::{PerRowError, RpcError, Sidecars, WriteRequest, WriteResponse, WriteRpc};

/// The table used throughout the session tests: `{key INT32 PK, v STRING
/// NULL}`, range partitioned over the key.
pub fn test_table() -> Arc<Table> {
    let schema = Schema::new(vec![
        ColumnSchema::new("key", DataType::Int32).key(),
        ColumnSchema::new("v", DataType::String).nullable(),
    ])
    .unwrap();
    let partition_schema = PartitionSchema::simple_range(&schema);
    Arc::new(Table::new(
        TableId::new("test-table-id"),
        "test_table",
        schema,
        partition_schema,
    ))
}

/// The partition key an `int32` range column encodes to. Useful for
/// building tablet bounds that line up with [`test_table`] rows.
pub fn int32_partition_key(key: i32) -> Vec<u8> {
    ((key as u32) ^ (1 << 31)).to_be_bytes().to_vec()
}

/// A located tablet named `id` covering `[lower, upper)` of partition-key
/// space, with a single leader replica.
pub fn tablet(id: &str, lower: Vec<u8>, upper: Vec<u8>) -> LocatedTablet {
    LocatedTablet {
        tablet_id: TabletId::new(id),
        partition: Partition::new(lower, upper),
        replicas: vec![TabletReplica {
            uuid: format!("ts-{id}"),
            host: "ts1.example.com".to_owned(),
            port: 7050,
            role: ReplicaRole::Leader,
        }],
    }
}

/// A [`TabletLocator`] serving a fixed set of tablets out of memory.
///
/// Lookups not covered by any tablet fail with
/// [`LookupError::NonCoveredRange`]; failures can also be scripted.
#[derive(Debug, Default)]
pub struct MockTabletLocator {
    tablets: Mutex<Vec<LocatedTablet>>,
    lookups: Mutex<Vec<Vec<u8>>>,
    delay: Mutex<Option<Duration>>,
    scripted_failures: Mutex<VecDeque<LookupError>>,
}

impl MockTabletLocator {
    /// An empty locator; every lookup fails with `NonCoveredRange`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A locator with a single tablet covering all of partition-key space.
    pub fn covering_all(tablet_id: &str) -> Self {
        let locator = Self::new();
        locator.add_tablet(tablet(tablet_id, Vec::new(), Vec::new()));
        locator
    }

    /// Register a tablet.
    pub fn add_tablet(&self, tablet: LocatedTablet) {
        self.tablets.lock().push(tablet);
    }

    /// Delay every lookup by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Fail the next lookup with `error` (FIFO when called repeatedly).
    pub fn fail_next(&self, error: LookupError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// The partition keys looked up so far.
    pub fn lookups(&self) -> Vec<Vec<u8>> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl TabletLocator for MockTabletLocator {
    async fn locate_tablet(
        &self,
        _table: &TableId,
        partition_key: &[u8],
        _deadline: Option<Duration>,
    ) -> Result<LocatedTablet, LookupError> {
        self.lookups.lock().push(partition_key.to_vec());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }

        self.tablets
            .lock()
            .iter()
            .find(|t| t.partition.covers(partition_key))
            .cloned()
            .ok_or_else(|| LookupError::NonCoveredRange {
                partition_key: partition_key.to_vec(),
            })
    }
}

#[derive(Debug)]
enum ScriptedResponse {
    Response(Result<WriteResponse, RpcError>),
    RowErrors(Vec<PerRowError>),
}

/// A [`WriteRpc`] recording every request and answering from a script.
///
/// Unscripted requests succeed with a fresh write timestamp and a
/// tablet-server uuid of `ts-<tablet id>`. RPCs can be held in flight with
/// [`Self::hold_rpcs`] to keep buffers in the flushing state, or delayed
/// per tablet to exercise response reordering.
#[derive(Debug)]
pub struct MockWriteRpc {
    requests: Mutex<Vec<WriteRequest>>,
    scripted: Mutex<VecDeque<ScriptedResponse>>,
    propagated: Mutex<Option<u64>>,
    next_timestamp: AtomicU64,
    default_timeout: Duration,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    gate_tx: Mutex<Option<watch::Sender<bool>>>,
    tablet_delays: Mutex<HashMap<TabletId, Duration>>,
}

impl Default for MockWriteRpc {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            propagated: Mutex::new(None),
            next_timestamp: AtomicU64::new(1),
            default_timeout: Duration::from_secs(30),
            gate: Mutex::new(None),
            gate_tx: Mutex::new(None),
            tablet_delays: Mutex::new(HashMap::new()),
        }
    }
}

impl MockWriteRpc {
    /// A transport where every request succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests sent so far, in dispatch order.
    pub fn requests(&self) -> Vec<WriteRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Script the next response verbatim.
    pub fn enqueue_response(&self, response: Result<WriteResponse, RpcError>) {
        self.scripted
            .lock()
            .push_back(ScriptedResponse::Response(response));
    }

    /// Script the next response as a success carrying the given per-row
    /// errors.
    pub fn enqueue_row_errors(&self, errors: Vec<(u32, RowErrorCode, &str)>) {
        let errors = errors
            .into_iter()
            .map(|(row_index, code, message)| PerRowError {
                row_index,
                code,
                message: message.to_owned(),
            })
            .collect();
        self.scripted
            .lock()
            .push_back(ScriptedResponse::RowErrors(errors));
    }

    /// Script the next request to fail as a whole.
    pub fn enqueue_failure(&self, error: RpcError) {
        self.enqueue_response(Err(error));
    }

    /// Hold every subsequent request in flight until
    /// [`Self::release_rpcs`].
    pub fn hold_rpcs(&self) {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock() = Some(rx);
        *self.gate_tx.lock() = Some(tx);
    }

    /// Release requests held by [`Self::hold_rpcs`].
    pub fn release_rpcs(&self) {
        *self.gate.lock() = None;
        if let Some(tx) = self.gate_tx.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Delay responses for `tablet_id` by `delay`.
    pub fn delay_tablet(&self, tablet_id: &TabletId, delay: Duration) {
        self.tablet_delays.lock().insert(tablet_id.clone(), delay);
    }

    fn make_response(&self, request: &WriteRequest, per_row_errors: Vec<PerRowError>) -> WriteResponse {
        WriteResponse {
            write_timestamp: self.next_timestamp.fetch_add(1, Ordering::SeqCst),
            tserver_uuid: format!("ts-{}", request.tablet_id),
            per_row_errors,
            sidecars: Sidecars::default(),
        }
    }
}

#[async_trait]
impl WriteRpc for MockWriteRpc {
    async fn send(&self, request: WriteRequest) -> Result<WriteResponse, RpcError> {
        let gate = self.gate.lock().clone();
        let delay = self.tablet_delays.lock().get(&request.tablet_id).copied();
        self.requests.lock().push(request.clone());

        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|released| *released).await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.scripted.lock().pop_front() {
            Some(ScriptedResponse::Response(response)) => response,
            Some(ScriptedResponse::RowErrors(errors)) => Ok(self.make_response(&request, errors)),
            None => Ok(self.make_response(&request, Vec::new())),
        }
    }

    fn update_last_propagated_timestamp(&self, timestamp: u64) {
        let mut propagated = self.propagated.lock();
        *propagated = Some(propagated.map_or(timestamp, |cur| cur.max(timestamp)));
    }

    fn last_propagated_timestamp(&self) -> Option<u64> {
        *self.propagated.lock()
    }

    fn default_operation_timeout(&self) -> Duration {
        self.default_timeout
    }
}
