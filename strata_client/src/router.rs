//! Tablet location interface.
//!
//! The session resolves every buffered operation's partition key to a
//! tablet before it can batch. Resolution is served out of the client's
//! metadata cache behind [`TabletLocator`]; the session treats it as a
//! plain async dependency and never caches locations itself.

use std::time::Duration;

use async_trait::async_trait;
use data_types::{Partition, TableId, TabletId};
use thiserror::Error;

/// The role a replica currently plays in its tablet's Raft configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Learner,
}

/// One replica of a located tablet.
#[derive(Debug, Clone)]
pub struct TabletReplica {
    /// UUID of the tablet server hosting the replica.
    pub uuid: String,
    /// Hostname of the tablet server's RPC endpoint.
    pub host: String,
    /// Port of the tablet server's RPC endpoint.
    pub port: u16,
    /// Current role.
    pub role: ReplicaRole,
}

/// A tablet as resolved from cluster metadata: its id, the partition-key
/// range it owns, and the replicas serving it.
#[derive(Debug, Clone)]
pub struct LocatedTablet {
    /// The tablet id.
    pub tablet_id: TabletId,
    /// The partition-key interval this tablet owns.
    pub partition: Partition,
    /// Known replicas at resolution time.
    pub replicas: Vec<TabletReplica>,
}

impl LocatedTablet {
    /// The leader replica, when the metadata knows one.
    pub fn leader_replica(&self) -> Option<&TabletReplica> {
        self.replicas
            .iter()
            .find(|r| r.role == ReplicaRole::Leader)
    }
}

/// Why a tablet lookup failed.
#[derive(Debug, Error, Clone)]
pub enum LookupError {
    /// The partition key falls outside every tablet's range; the table's
    /// range partitions do not cover it.
    #[error("no tablet covers the requested partition key")]
    NonCoveredRange {
        /// The uncovered key.
        partition_key: Vec<u8>,
    },

    /// The deadline elapsed before the location was resolved.
    #[error("tablet lookup timed out")]
    TimedOut,

    /// The metadata connection failed.
    #[error("transport error during tablet lookup: {message}")]
    Transport {
        /// Human-readable detail.
        message: String,
    },

    /// No master is reachable or none is leader.
    #[error("master unavailable: {message}")]
    MasterUnavailable {
        /// Human-readable detail.
        message: String,
    },
}

/// Asynchronous partition-key to tablet resolution.
#[async_trait]
pub trait TabletLocator: std::fmt::Debug + Send + Sync + 'static {
    /// Resolve the tablet owning `partition_key` in `table`.
    async fn locate_tablet(
        &self,
        table: &TableId,
        partition_key: &[u8],
        deadline: Option<Duration>,
    ) -> Result<LocatedTablet, LookupError>;
}
