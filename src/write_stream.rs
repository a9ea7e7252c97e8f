// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{upsert::UpsertFn, Lsn, Record, Slice, UserKey, ValueKind};
use std::iter::Peekable;

type Item = crate::Result<Record>;

/// A callback for filtering records out of the stream (TTL expiry).
pub trait RetentionFilter {
    /// Returns `true` if the record should be dropped from the output.
    fn should_remove(&mut self, item: &Record) -> bool;
}

/// A [`RetentionFilter`] that does not filter anything out.
pub struct NoFilter;

impl RetentionFilter for NoFilter {
    fn should_remove(&mut self, _item: &Record) -> bool {
        false
    }
}

/// Drops records whose timestamp is older than the TTL.
pub struct TtlFilter {
    ttl_secs: u32,
    now: u32,
}

impl TtlFilter {
    #[must_use]
    pub fn new(ttl_secs: u32, now: u32) -> Self {
        Self { ttl_secs, now }
    }
}

impl RetentionFilter for TtlFilter {
    fn should_remove(&mut self, item: &Record) -> bool {
        self.now.saturating_sub(item.timestamp) >= self.ttl_secs
    }
}

/// Consumes a merged record stream and applies the retention policy,
/// producing the input stream for a new branch or node
///
/// - exactly one version is kept for every key that has a version with
///   LSN ≤ `vlsn` (the oldest active visibility horizon); younger
///   versions are all retained,
/// - below `vlsn_lru` all versions are discarded,
/// - tombstones are dropped once nothing can hide beneath them (the
///   output is the root of a node) and `vlsn` has passed them,
/// - upserts at or below `vlsn` are folded when the output is a node root
///   and a merge function is registered; otherwise the chain is retained.
///
/// This iterator is used during branching & compaction.
pub struct RetentionStream<I: Iterator<Item = Item>, F: RetentionFilter = NoFilter> {
    /// Record stream
    inner: Peekable<I>,

    /// MVCC watermark to get rid of old versions
    vlsn: Lsn,

    /// Horizon below which every version may be discarded
    vlsn_lru: Lsn,

    /// Whether the output is the root branch of a node
    evict_tombstones: bool,

    /// Fold upserts below the watermark (requires `evict_tombstones`)
    upsert_fn: Option<UpsertFn>,

    /// Stream filter
    filter: F,

    /// Unfolded upsert-chain entries queued for emission
    retained: std::collections::VecDeque<Record>,
}

impl<I: Iterator<Item = Item>> RetentionStream<I, NoFilter> {
    /// Initializes a new retention stream.
    #[must_use]
    pub fn new(iter: I, vlsn: Lsn) -> Self {
        Self {
            inner: iter.peekable(),
            vlsn,
            vlsn_lru: 0,
            evict_tombstones: false,
            upsert_fn: None,
            filter: NoFilter,
            retained: std::collections::VecDeque::new(),
        }
    }
}

impl<I: Iterator<Item = Item>, F: RetentionFilter> RetentionStream<I, F> {
    /// Installs a filter into this stream.
    pub fn with_filter<NF: RetentionFilter>(self, filter: NF) -> RetentionStream<I, NF> {
        RetentionStream {
            inner: self.inner,
            vlsn: self.vlsn,
            vlsn_lru: self.vlsn_lru,
            evict_tombstones: self.evict_tombstones,
            upsert_fn: self.upsert_fn,
            filter,
            retained: self.retained,
        }
    }

    /// Enables tombstone eviction (output is a node root).
    pub fn evict_tombstones(mut self, b: bool) -> Self {
        self.evict_tombstones = b;
        self
    }

    /// Sets the horizon below which all versions are discarded.
    pub fn vlsn_lru(mut self, lsn: Lsn) -> Self {
        self.vlsn_lru = lsn;
        self
    }

    /// Enables upsert folding with the given merge function.
    pub fn fold_upserts(mut self, upsert_fn: Option<UpsertFn>) -> Self {
        self.upsert_fn = upsert_fn;
        self
    }

    /// Drains the remaining versions of the given key.
    fn drain_key(&mut self, key: &UserKey) -> crate::Result<()> {
        loop {
            let Some(next) = self.inner.next_if(|kv| {
                if let Ok(kv) = kv {
                    kv.key.user_key == key
                } else {
                    true
                }
            }) else {
                return Ok(());
            };

            next?;
        }
    }

    /// Gathers `head`'s upsert run plus its base, newest-first.
    fn gather_chain(&mut self, head: Record) -> crate::Result<Vec<Record>> {
        let mut chain = vec![head];

        loop {
            let Some(next) = self.inner.next_if(|kv| {
                if let Ok(kv) = kv {
                    kv.key.user_key == chain[0].key.user_key
                } else {
                    true
                }
            }) else {
                break;
            };

            let next = next?;
            let is_base = next.key.kind != ValueKind::Upsert;
            chain.push(next);

            if is_base {
                break;
            }
        }

        Ok(chain)
    }
}

impl<I: Iterator<Item = Item>, F: RetentionFilter> Iterator for RetentionStream<I, F> {
    type Item = Item;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.retained.pop_front() {
            return Some(Ok(record));
        }

        loop {
            let mut head = fail_iter!(self.inner.next()?);

            if !head.is_tombstone() && self.filter.should_remove(&head) {
                // expired; replace with a tombstone so older versions in
                // deeper branches stay shadowed
                head.key.kind = ValueKind::Tombstone;
                head.value = Slice::empty();
            }

            // Versions above the watermark may still be visible to some
            // reader; retain them untouched
            if head.key.lsn > self.vlsn {
                return Some(Ok(head));
            }

            // `head` is the newest version at or below the watermark: the
            // single version retention keeps for this key

            if head.key.kind == ValueKind::Upsert {
                if self.evict_tombstones && self.upsert_fn.is_some() {
                    let chain = fail_iter!(self.gather_chain(head));
                    let key = chain[0].key.user_key.clone();

                    let folded = crate::upsert::fold(self.upsert_fn.as_ref(), &chain);
                    fail_iter!(self.drain_key(&key));

                    match folded {
                        Some(record) if record.key.lsn > self.vlsn_lru => {
                            return Some(Ok(record));
                        }
                        _ => continue,
                    }
                }

                // No folding possible: the base may live in a branch not
                // part of this merge, so the whole visible chain must
                // survive
                let chain = fail_iter!(self.gather_chain(head));
                let key = chain[0].key.user_key.clone();
                fail_iter!(self.drain_key(&key));

                // Hand the chain out one by one through a small buffer
                // (newest first, matching stream order)
                if let Some((first, rest)) = chain.split_first() {
                    for record in rest {
                        self.retained.push_back(record.clone());
                    }
                    return Some(Ok(first.clone()));
                }

                continue;
            }

            // everything older than `head` is garbage
            fail_iter!(self.drain_key(&head.key.user_key));

            if head.key.lsn <= self.vlsn_lru {
                continue;
            }

            if head.is_tombstone() && self.evict_tombstones {
                continue;
            }

            return Some(Ok(head));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{Record, ValueKind};
    use test_log::test;

    fn v(key: &str, value: &str, lsn: u64) -> Record {
        Record::from_components(key.as_bytes(), value.as_bytes(), lsn, ValueKind::Value)
    }

    fn t(key: &str, lsn: u64) -> Record {
        Record::new_tombstone(key.as_bytes().to_vec(), lsn)
    }

    fn run<F: RetentionFilter>(
        stream: &[Record],
        build: impl FnOnce(
            RetentionStream<std::vec::IntoIter<Item>, NoFilter>,
        ) -> RetentionStream<std::vec::IntoIter<Item>, F>,
    ) -> Vec<Record> {
        let iter = stream
            .iter()
            .cloned()
            .map(Ok)
            .collect::<Vec<_>>()
            .into_iter();

        build(RetentionStream::new(iter, u64::MAX))
            .collect::<crate::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn retention_keeps_one_version_below_watermark() {
        let stream = [v("a", "3", 3), v("a", "2", 2), v("a", "1", 1)];

        let iter = stream
            .iter()
            .cloned()
            .map(Ok)
            .collect::<Vec<_>>()
            .into_iter();

        // watermark 2: version 3 is above (retained), version 2 is the one
        // visible version, version 1 is garbage
        let out = RetentionStream::new(iter, 2)
            .collect::<crate::Result<Vec<_>>>()
            .unwrap();

        assert_eq!(vec![3, 2], out.iter().map(|r| r.key.lsn).collect::<Vec<_>>());
    }

    #[test]
    fn retention_evicts_tombstones_at_root() {
        let stream = [t("a", 2), v("a", "1", 1), v("b", "1", 1)];

        let out = run(&stream, |s| s.evict_tombstones(true));
        assert_eq!(1, out.len());
        assert_eq!(b"b", &*out[0].key.user_key);
    }

    #[test]
    fn retention_keeps_tombstones_in_child_branches() {
        let stream = [t("a", 2), v("a", "1", 1)];

        let out = run(&stream, |s| s);
        assert_eq!(1, out.len());
        assert!(out[0].is_tombstone());
    }

    #[test]
    fn retention_drops_everything_below_lru_horizon() {
        let stream = [v("a", "2", 2), v("b", "9", 9)];

        let out = run(&stream, |s| s.vlsn_lru(5));
        assert_eq!(1, out.len());
        assert_eq!(b"b", &*out[0].key.user_key);
    }

    #[test]
    fn retention_folds_upserts_at_root() {
        let concat: crate::upsert::UpsertFn =
            std::sync::Arc::new(|_key, existing, delta| {
                let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
                out.extend_from_slice(delta);
                Some(crate::Slice::from(out))
            });

        let stream = [
            Record::new_upsert(b"k".to_vec(), b"B".to_vec(), 2),
            Record::new_upsert(b"k".to_vec(), b"A".to_vec(), 1),
        ];

        let out = run(&stream, |s| s.evict_tombstones(true).fold_upserts(Some(concat)));

        assert_eq!(1, out.len());
        assert_eq!(b"AB", &*out[0].value);
        assert_eq!(ValueKind::Value, out[0].key.kind);
    }

    #[test]
    fn retention_retains_unfolded_upsert_chain() {
        let stream = [
            Record::new_upsert(b"k".to_vec(), b"B".to_vec(), 2),
            Record::new_upsert(b"k".to_vec(), b"A".to_vec(), 1),
        ];

        // not a root branch: the base may be deeper, keep the whole chain
        let out = run(&stream, |s| s);
        assert_eq!(2, out.len());
        assert!(out.iter().all(Record::is_upsert));
    }

    #[test]
    fn retention_ttl_filter_expires() {
        let now = 1_000;

        let mut old = v("old", "x", 1);
        old.timestamp = now - 10;
        let mut fresh = v("new", "y", 2);
        fresh.timestamp = now - 1;

        let stream = [fresh, old];

        let out = run(&stream, |s| {
            s.evict_tombstones(true).with_filter(TtlFilter::new(5, now))
        });

        assert_eq!(1, out.len());
        assert_eq!(b"new", &*out[0].key.user_key);
    }
}
