// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::InternalKey;
use crate::{
    value::{Lsn, Record, UserValue},
    UserKey, ValueKind,
};
use crossbeam_skiplist::SkipMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Payload half of a memory-index entry
#[derive(Clone)]
pub struct MemEntry {
    pub value: UserValue,
    pub timestamp: u32,
}

/// The in-memory write buffer of one node (`i0`, or `i1` while rotated)
///
/// Entries are keyed by [`InternalKey`], so all versions of one user key
/// form a contiguous chain ordered by descending LSN; the chain head (the
/// first entry of a key) carries the highest LSN. LSNs within a chain are
/// distinct because a transaction owns at most one version per key.
///
/// When the index exceeds the branch watermark, a branching task seals it
/// to disk as a new branch of its node.
pub struct MemIndex {
    /// The actual content, stored in a lock-free skiplist.
    #[doc(hidden)]
    pub items: SkipMap<InternalKey, MemEntry>,

    /// Approximate byte usage.
    ///
    /// If this grows too large, a branching task is triggered.
    approximate_size: AtomicU64,

    /// Highest encountered LSN.
    highest_lsn: AtomicU64,

    /// Lowest encountered LSN (monotonic-down), used by checkpoints and
    /// WAL garbage collection.
    lowest_lsn: AtomicU64,

    /// Lowest encountered record timestamp, used by TTL expiry.
    lowest_timestamp: AtomicU64,

    /// Last write wall-clock time (unix seconds), used by the age rule.
    last_touched: AtomicU64,

    requested_rotation: AtomicBool,
}

impl Default for MemIndex {
    fn default() -> Self {
        Self {
            items: SkipMap::new(),
            approximate_size: AtomicU64::new(0),
            highest_lsn: AtomicU64::new(0),
            lowest_lsn: AtomicU64::new(u64::MAX),
            lowest_timestamp: AtomicU64::new(u64::MAX),
            last_touched: AtomicU64::new(0),
            requested_rotation: AtomicBool::new(false),
        }
    }
}

impl MemIndex {
    /// Returns `true` if the index was already flagged for rotation.
    pub fn is_flagged_for_rotation(&self) -> bool {
        self.requested_rotation.load(Ordering::Relaxed)
    }

    /// Flags the index as requested for rotation.
    pub fn flag_rotated(&self) {
        self.requested_rotation.store(true, Ordering::Relaxed);
    }

    /// Creates an iterator over all items.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Record> + '_ {
        self.items.iter().map(|entry| Record {
            key: entry.key().clone(),
            value: entry.value().value.clone(),
            timestamp: entry.value().timestamp,
        })
    }

    /// Creates an iterator over a range of items.
    pub fn range<'a, R: RangeBounds<InternalKey> + 'a>(
        &'a self,
        range: R,
    ) -> impl DoubleEndedIterator<Item = Record> + 'a {
        self.items.range(range).map(|entry| Record {
            key: entry.key().clone(),
            value: entry.value().value.clone(),
            timestamp: entry.value().timestamp,
        })
    }

    /// Returns the newest version of `key` visible at `vlsn`, if any.
    ///
    /// `vlsn` is inclusive: a record with LSN == vlsn is visible.
    #[doc(hidden)]
    pub fn get(&self, key: &[u8], vlsn: Lsn) -> Option<Record> {
        // NOTE: Entries are multi-sorted by (user key asc, LSN desc), so
        // the first entry at or after (key, vlsn) that still has our user
        // key is the newest visible version:
        //
        // key -> lsn
        //
        // a   -> 7
        // abc -> 5 <<< lowest entry >= (abc, MAX), the newest version
        // abc -> 4
        // abc -> 3 <<< lowest entry >= (abc, 3), newest visible at vlsn=3
        // abcdef -> 6
        // abcdef -> 5
        let lower_bound = InternalKey::new(key, vlsn, ValueKind::Value);

        let mut iter = self
            .items
            .range(lower_bound..)
            .take_while(|entry| &*entry.key().user_key == key);

        iter.next().map(|entry| Record {
            key: entry.key().clone(),
            value: entry.value().value.clone(),
            timestamp: entry.value().timestamp,
        })
    }

    /// Collects every version of `key` visible at `vlsn`, newest first,
    /// stopping after the first non-upsert record.
    ///
    /// Used by the read path to fold pending upserts.
    pub fn get_chain(&self, key: &[u8], vlsn: Lsn) -> Vec<Record> {
        let lower_bound = InternalKey::new(key, vlsn, ValueKind::Value);

        let mut chain = vec![];

        for entry in self
            .items
            .range(lower_bound..)
            .take_while(|entry| &*entry.key().user_key == key)
        {
            let is_upsert = entry.key().kind == ValueKind::Upsert;

            chain.push(Record {
                key: entry.key().clone(),
                value: entry.value().value.clone(),
                timestamp: entry.value().timestamp,
            });

            if !is_upsert {
                break;
            }
        }

        chain
    }

    /// Gets approximate size of the index in bytes.
    pub fn size(&self) -> u64 {
        self.approximate_size.load(Ordering::Acquire)
    }

    /// Counts the number of items in the index.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts a record, returning `(item size, size after)`.
    #[doc(hidden)]
    pub fn insert(&self, record: Record) -> (u64, u64) {
        #[allow(clippy::expect_used)]
        let item_size = (record.size()).try_into().expect("should fit into u64");

        let size_before = self.approximate_size.fetch_add(item_size, Ordering::AcqRel);

        self.highest_lsn.fetch_max(record.key.lsn, Ordering::AcqRel);
        self.lowest_lsn.fetch_min(record.key.lsn, Ordering::AcqRel);
        self.lowest_timestamp
            .fetch_min(u64::from(record.timestamp), Ordering::AcqRel);
        self.last_touched
            .store(crate::time::unix_timestamp().as_secs(), Ordering::Release);

        self.items.insert(
            record.key,
            MemEntry {
                value: record.value,
                timestamp: record.timestamp,
            },
        );

        (item_size, size_before + item_size)
    }

    /// Returns the highest LSN in the index.
    pub fn highest_lsn(&self) -> Option<Lsn> {
        if self.is_empty() {
            None
        } else {
            Some(self.highest_lsn.load(Ordering::Acquire))
        }
    }

    /// Returns the lowest LSN in the index.
    pub fn lowest_lsn(&self) -> Option<Lsn> {
        if self.is_empty() {
            None
        } else {
            Some(self.lowest_lsn.load(Ordering::Acquire))
        }
    }

    /// Returns the lowest record timestamp in the index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn lowest_timestamp(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.lowest_timestamp.load(Ordering::Acquire) as u32)
        }
    }

    /// Seconds since the last write into this index.
    pub fn idle_secs(&self) -> u64 {
        let touched = self.last_touched.load(Ordering::Acquire);
        crate::time::unix_timestamp()
            .as_secs()
            .saturating_sub(touched)
    }

    /// The range of a single user key, for chain walks.
    pub fn key_range_bounds(key: &UserKey) -> (InternalKey, InternalKey) {
        (
            InternalKey::new(key.clone(), Lsn::MAX, ValueKind::Value),
            InternalKey::new(key.clone(), 0, ValueKind::Tombstone),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ValueKind;
    use test_log::test;

    #[test]
    fn memindex_mvcc_point_read() {
        let index = MemIndex::default();

        index.insert(Record::from_components(
            *b"hello-key-999991",
            *b"hello-value-999991",
            1,
            ValueKind::Value,
        ));

        let item = index.get(b"hello-key-99999", Lsn::MAX);
        assert!(item.is_none());

        let item = index.get(b"hello-key-999991", Lsn::MAX);
        assert_eq!(*b"hello-value-999991", &*item.unwrap().value);

        index.insert(Record::from_components(
            *b"hello-key-999991",
            *b"hello-value-999991-2",
            2,
            ValueKind::Value,
        ));

        let item = index.get(b"hello-key-999991", Lsn::MAX);
        assert_eq!(*b"hello-value-999991-2", &*item.unwrap().value);

        // at vlsn = 1 only the first version is visible
        let item = index.get(b"hello-key-999991", 1);
        assert_eq!(*b"hello-value-999991", &*item.unwrap().value);

        let item = index.get(b"hello-key-999991", 2);
        assert_eq!(*b"hello-value-999991-2", &*item.unwrap().value);
    }

    #[test]
    fn memindex_chain_head_has_highest_lsn() {
        let index = MemIndex::default();

        for lsn in [3, 1, 7, 2] {
            index.insert(Record::from_components(
                b"k".to_vec(),
                lsn.to_string(),
                lsn,
                ValueKind::Value,
            ));
        }

        let versions = index.iter().collect::<Vec<_>>();
        let lsns = versions.iter().map(|r| r.key.lsn).collect::<Vec<_>>();

        // strictly decreasing from head to tail
        assert_eq!(vec![7, 3, 2, 1], lsns);
        assert_eq!(Some(7), index.highest_lsn());
        assert_eq!(Some(1), index.lowest_lsn());
    }

    #[test]
    fn memindex_get_chain_stops_at_base() {
        let index = MemIndex::default();

        index.insert(Record::from_components(
            b"k".to_vec(),
            b"base".to_vec(),
            1,
            ValueKind::Value,
        ));
        index.insert(Record::new_upsert(b"k".to_vec(), b"d1".to_vec(), 2));
        index.insert(Record::new_upsert(b"k".to_vec(), b"d2".to_vec(), 3));

        let chain = index.get_chain(b"k", Lsn::MAX);
        assert_eq!(3, chain.len());
        assert_eq!(3, chain[0].key.lsn);
        assert_eq!(ValueKind::Value, chain[2].key.kind);
    }

    #[test]
    fn memindex_prefixed_key_is_distinct() {
        let index = MemIndex::default();

        index.insert(Record::from_components(
            b"abc0".to_vec(),
            b"abc".to_vec(),
            1,
            ValueKind::Value,
        ));
        index.insert(Record::from_components(
            b"abc".to_vec(),
            b"abc".to_vec(),
            255,
            ValueKind::Value,
        ));

        assert_eq!(255, index.get(b"abc", Lsn::MAX).unwrap().key.lsn);
        assert_eq!(1, index.get(b"abc0", Lsn::MAX).unwrap().key.lsn);
    }
}
