//! Collects row errors observed by background flushes.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::trace;

use crate::response::{PendingErrors, RowError};

/// A bounded queue of row errors. When full, the oldest error is dropped
/// and the overflow flag is raised until the next drain.
#[derive(Debug)]
pub(crate) struct ErrorCollector {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    errors: VecDeque<RowError>,
    max_capacity: usize,
    overflowed: bool,
}

impl ErrorCollector {
    pub(crate) fn new(max_capacity: usize) -> Self {
        assert!(max_capacity > 0, "error collector capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                errors: VecDeque::with_capacity(max_capacity),
                max_capacity,
                overflowed: false,
            }),
        }
    }

    pub(crate) fn add(&self, error: RowError) {
        let mut inner = self.inner.lock();
        if inner.errors.len() >= inner.max_capacity {
            trace!("error collector overflowed, dropping oldest error");
            inner.errors.pop_front();
            inner.overflowed = true;
        }
        inner.errors.push_back(error);
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.lock().errors.len()
    }

    /// Drain all collected errors and clear the overflow flag.
    pub(crate) fn take_all(&self) -> PendingErrors {
        let mut inner = self.inner.lock();
        let overflowed = std::mem::take(&mut inner.overflowed);
        PendingErrors {
            errors: std::mem::take(&mut inner.errors).into(),
            overflowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::WriteOperation;
    use crate::response::RowErrorCode;
    use crate::test_util::test_table;

    fn error(n: i32) -> RowError {
        let mut op = WriteOperation::insert(test_table());
        op.row_mut().set_i32("key", n).unwrap();
        RowError::new(RowErrorCode::RuntimeError, format!("error {n}"), &op)
    }

    #[test]
    fn test_add_count_drain() {
        let collector = ErrorCollector::new(10);
        assert_eq!(collector.count(), 0);

        collector.add(error(1));
        collector.add(error(2));
        assert_eq!(collector.count(), 2);

        let drained = collector.take_all();
        assert_eq!(drained.errors.len(), 2);
        assert!(!drained.overflowed);
        assert_eq!(drained.errors[0].message, "error 1");
        assert_eq!(collector.count(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let collector = ErrorCollector::new(2);
        collector.add(error(1));
        collector.add(error(2));
        collector.add(error(3));

        assert_eq!(collector.count(), 2);
        let drained = collector.take_all();
        assert!(drained.overflowed);
        assert_eq!(drained.errors[0].message, "error 2");
        assert_eq!(drained.errors[1].message, "error 3");

        // Draining cleared the overflow flag.
        collector.add(error(4));
        assert!(!collector.take_all().overflowed);
    }
}
