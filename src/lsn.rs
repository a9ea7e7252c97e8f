// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Lsn;
use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// Thread-safe log sequence number generator
///
/// Every committed write carries an LSN handed out by this counter; the same
/// type also backs the transaction (`tsn`) and commit (`csn`) sequences of the
/// MVCC manager and the id sequences for nodes, branches and WAL segments.
///
/// LSN ordering is total and matches WAL-append order.
#[derive(Clone, Default, Debug)]
pub struct LsnCounter(Arc<AtomicU64>);

impl LsnCounter {
    /// Creates a new counter, setting it to some previous value
    #[must_use]
    pub fn new(prev: Lsn) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Gets the current value without incrementing the counter.
    ///
    /// Used to freeze a transaction's visibility horizon (`vlsn`).
    #[must_use]
    pub fn get(&self) -> Lsn {
        self.0.load(Acquire)
    }

    /// Gets the next value.
    #[must_use]
    pub fn next(&self) -> Lsn {
        self.0.fetch_add(1, AcqRel) + 1
    }

    /// Sets the value.
    pub fn set(&self, lsn: Lsn) {
        self.0.store(lsn, Release);
    }

    /// Maximizes the value, used during recovery replay.
    pub fn fetch_max(&self, lsn: Lsn) {
        self.0.fetch_max(lsn, AcqRel);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::LsnCounter;
    use test_log::test;

    #[test]
    fn lsn_counter_monotonic() {
        let counter = LsnCounter::default();
        assert_eq!(0, counter.get());
        assert_eq!(1, counter.next());
        assert_eq!(2, counter.next());
        assert_eq!(2, counter.get());

        counter.fetch_max(10);
        assert_eq!(10, counter.get());
        counter.fetch_max(5);
        assert_eq!(10, counter.get());
    }
}
