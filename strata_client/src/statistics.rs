//! Per-tablet write statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use data_types::TabletId;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// The counters tracked per (table, tablet) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    /// Rows written successfully.
    WriteOps,
    /// Write RPCs sent.
    WriteRpcs,
    /// Rows that failed with a row error.
    OpsErrors,
    /// Write RPCs that failed as a whole.
    RpcErrors,
    /// Encoded row-operation bytes acknowledged by the server.
    BytesWritten,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WriteOps => "write_ops",
            Self::WriteRpcs => "write_rpcs",
            Self::OpsErrors => "ops_errors",
            Self::RpcErrors => "rpc_errors",
            Self::BytesWritten => "bytes_written",
        };
        f.write_str(name)
    }
}

/// Counters for one (table, tablet) pair.
#[derive(Debug, Default)]
pub struct TabletStatistics {
    write_ops: AtomicU64,
    write_rpcs: AtomicU64,
    ops_errors: AtomicU64,
    rpc_errors: AtomicU64,
    bytes_written: AtomicU64,
}

impl TabletStatistics {
    /// Read one counter.
    pub fn get(&self, statistic: Statistic) -> u64 {
        self.counter(statistic).load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self, statistic: Statistic, amount: u64) {
        self.counter(statistic).fetch_add(amount, Ordering::Relaxed);
    }

    fn counter(&self, statistic: Statistic) -> &AtomicU64 {
        match statistic {
            Statistic::WriteOps => &self.write_ops,
            Statistic::WriteRpcs => &self.write_rpcs,
            Statistic::OpsErrors => &self.ops_errors,
            Statistic::RpcErrors => &self.rpc_errors,
            Statistic::BytesWritten => &self.bytes_written,
        }
    }
}

/// Write statistics for every tablet a session has touched. Cheap to clone
/// and safe to read while writes are in flight.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    tablets: Arc<Mutex<HashMap<(String, TabletId), Arc<TabletStatistics>>>>,
}

impl Statistics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The counters for `(table_name, tablet_id)`, creating them on first
    /// touch.
    pub(crate) fn tablet(&self, table_name: &str, tablet_id: &TabletId) -> Arc<TabletStatistics> {
        let mut tablets = self.tablets.lock();
        let entry = tablets
            .entry((table_name.to_owned(), tablet_id.clone()))
            .or_default();
        Arc::clone(entry)
    }

    /// Read one counter, 0 if the tablet has never been written to.
    pub fn get(&self, table_name: &str, tablet_id: &TabletId, statistic: Statistic) -> u64 {
        self.tablets
            .lock()
            .get(&(table_name.to_owned(), tablet_id.clone()))
            .map(|t| t.get(statistic))
            .unwrap_or(0)
    }

    /// The (table, tablet) pairs with recorded statistics.
    pub fn tablets(&self) -> Vec<(String, TabletId)> {
        self.tablets.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let statistics = Statistics::new();
        let tablet_id = TabletId::new("tablet-1");

        let tablet = statistics.tablet("t", &tablet_id);
        tablet.increment(Statistic::WriteOps, 2);
        tablet.increment(Statistic::BytesWritten, 128);

        assert_eq!(statistics.get("t", &tablet_id, Statistic::WriteOps), 2);
        assert_eq!(statistics.get("t", &tablet_id, Statistic::BytesWritten), 128);
        assert_eq!(statistics.get("t", &tablet_id, Statistic::RpcErrors), 0);
        assert_eq!(statistics.get("other", &tablet_id, Statistic::WriteOps), 0);

        // Clones observe the same counters.
        let clone = statistics.clone();
        clone.tablet("t", &tablet_id).increment(Statistic::WriteOps, 1);
        assert_eq!(statistics.get("t", &tablet_id, Statistic::WriteOps), 3);
        assert_eq!(statistics.tablets().len(), 1);
    }
}
