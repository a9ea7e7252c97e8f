// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Memory quota with cooperative back-pressure
///
/// Bytes are added after a record lands in a memory index and removed
/// after a branching task flushes them to disk. Producers wait when
/// used ≥ limit until a branch task releases bytes; waiting is not an
/// error.
pub struct Quota {
    /// 0 = unlimited
    limit: u64,

    used: Mutex<u64>,
    released: Condvar,
}

impl Quota {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Blocks until there is room, then accounts the bytes.
    ///
    /// Returns `false` if the wait timed out (the caller surfaces this as
    /// back-pressure, not as an error).
    #[must_use]
    pub fn acquire(&self, bytes: u64, timeout: Duration) -> bool {
        #[allow(clippy::expect_used)]
        let mut used = self.used.lock().expect("lock is poisoned");

        if self.limit > 0 {
            let deadline = std::time::Instant::now() + timeout;

            while *used >= self.limit {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());

                if remaining.is_zero() {
                    return false;
                }

                #[allow(clippy::expect_used)]
                let (guard, result) = self
                    .released
                    .wait_timeout(used, remaining)
                    .expect("lock is poisoned");

                used = guard;

                if result.timed_out() && *used >= self.limit {
                    return false;
                }
            }
        }

        *used += bytes;
        true
    }

    /// Releases bytes after they became durable, waking waiting
    /// producers.
    pub fn release(&self, bytes: u64) {
        #[allow(clippy::expect_used)]
        let mut used = self.used.lock().expect("lock is poisoned");

        *used = used.saturating_sub(bytes);
        self.released.notify_all();
    }

    /// Currently accounted bytes.
    #[must_use]
    pub fn used(&self) -> u64 {
        #[allow(clippy::expect_used)]
        *self.used.lock().expect("lock is poisoned")
    }

    /// Quota limit (0 = unlimited).
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Memory-usage bucket in steps of 10% of the quota, selecting the
    /// planner's task mix.
    #[must_use]
    pub fn zone(&self) -> u8 {
        if self.limit == 0 {
            return 0;
        }

        let used = self.used();

        #[allow(clippy::cast_possible_truncation)]
        let pct = (used.saturating_mul(100) / self.limit).min(100) as u8;

        pct / 10 * 10
    }
}
