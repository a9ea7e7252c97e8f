// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    db::Database,
    merge::{BoxedIterator, Merger},
    node::iter::{memindex_bounds, BranchRangeIter},
    read_stream::VisibilityStream,
    Env, Lsn, Record, Slice, UserKey,
};
use std::ops::Bound;
use std::sync::Arc;

/// Scan direction and positioning of a cursor
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Order {
    /// Forward from the key (inclusive), or from the start
    Gte,

    /// Forward from the key (exclusive)
    Gt,

    /// Reverse from the key (inclusive), or from the end
    Lte,

    /// Reverse from the key (exclusive)
    Lt,
}

impl Order {
    #[must_use]
    pub fn is_forward(self) -> bool {
        matches!(self, Self::Gte | Self::Gt)
    }
}

/// Smallest byte string strictly greater than every string with this
/// prefix, or `None` at the top of the key space.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();

    while let Some(last) = out.last() {
        if *last == u8::MAX {
            out.pop();
        } else {
            #[allow(clippy::expect_used)]
            {
                *out.last_mut().expect("non-empty") += 1;
            }
            return Some(out);
        }
    }

    None
}

/// A forward or reverse iterator over a read snapshot
///
/// Combines the memory indices and every branch of every node into one
/// ordered, LSN-filtered, upsert-folded stream. Tombstoned keys are
/// skipped; a cursor positioned past the last key yields no more items
/// (not an error).
pub struct Cursor {
    iter: Box<dyn Iterator<Item = crate::Result<Record>>>,

    /// `(env, vlsn)` kept alive so retention honors our horizon
    pin: Option<(Env, Lsn)>,
}

impl Cursor {
    /// Builds the cursor pipeline over a consistent node snapshot.
    pub(crate) fn build(
        env: &Env,
        db: &Arc<Database>,
        vlsn: Lsn,
        order: Order,
        key: Option<UserKey>,
        prefix: Option<Slice>,
        pin: bool,
    ) -> Self {
        // Range bounds from positioning key and prefix clamp
        let mut lo: Bound<UserKey> = Bound::Unbounded;
        let mut hi: Bound<UserKey> = Bound::Unbounded;

        if let Some(prefix) = &prefix {
            lo = Bound::Included(prefix.clone());
            hi = match prefix_successor(prefix) {
                Some(end) => Bound::Excluded(Slice::from(end)),
                None => Bound::Unbounded,
            };
        }

        if let Some(key) = key {
            match order {
                Order::Gte => {
                    if !matches!(&lo, Bound::Included(p) if **p > *key) {
                        lo = Bound::Included(key);
                    }
                }
                Order::Gt => lo = Bound::Excluded(key),
                Order::Lte => hi = Bound::Included(key),
                Order::Lt => hi = Bound::Excluded(key),
            }
        }

        let mut sources: Vec<BoxedIterator<'static>> = vec![];

        for node in db.tree.nodes() {
            let (mem_lo, mem_hi) = memindex_bounds(as_key_ref(&lo), as_key_ref(&hi));

            // the memory indices are bounded by the branch watermark, so
            // snapshotting the range is cheap and pins the entries
            let i0 = node
                .i0()
                .range((mem_lo.clone(), mem_hi.clone()))
                .collect::<Vec<_>>();
            sources.push(Box::new(i0.into_iter().map(Ok)));

            if let Some(i1) = node.i1() {
                let i1 = i1.range((mem_lo, mem_hi)).collect::<Vec<_>>();
                sources.push(Box::new(i1.into_iter().map(Ok)));
            }

            for branch in node.branches() {
                sources.push(Box::new(BranchRangeIter::new(
                    node.clone(),
                    branch,
                    env.inner.page_cache.clone(),
                    lo.clone(),
                    hi.clone(),
                )));
            }
        }

        let stream = VisibilityStream::new(Merger::new(sources), vlsn, db.upsert_fn());

        let iter: Box<dyn Iterator<Item = crate::Result<Record>>> = if order.is_forward() {
            Box::new(stream.filter(|item| {
                item.as_ref().map_or(true, |record| !record.is_tombstone())
            }))
        } else {
            Box::new(stream.rev().filter(|item| {
                item.as_ref().map_or(true, |record| !record.is_tombstone())
            }))
        };

        if pin {
            env.pin(vlsn);
        }

        Self {
            iter,
            pin: pin.then(|| (env.clone(), vlsn)),
        }
    }
}

fn as_key_ref(bound: &Bound<UserKey>) -> Bound<&UserKey> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(key) => Bound::Included(key),
        Bound::Excluded(key) => Bound::Excluded(key),
    }
}

impl Iterator for Cursor {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some((env, vlsn)) = self.pin.take() {
            env.unpin(vlsn);
        }
    }
}
