// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::double_ended_peekable::{DoubleEndedPeekable, DoubleEndedPeekableExt};
use crate::{upsert::UpsertFn, Lsn, Record, UserKey, ValueKind};

/// Consumes a merged record stream and emits at most one record per user
/// key: the newest version visible at `vlsn`, with pending upserts folded
///
/// Tombstones are emitted (they shadow older versions); the cursor layer
/// strips them. This iterator is used for read operations.
pub struct VisibilityStream<I: DoubleEndedIterator<Item = crate::Result<Record>>> {
    inner: DoubleEndedPeekable<I>,
    vlsn: Lsn,
    upsert_fn: Option<UpsertFn>,
}

impl<I: DoubleEndedIterator<Item = crate::Result<Record>>> VisibilityStream<I> {
    /// Initializes a new visibility stream.
    #[must_use]
    pub fn new(iter: I, vlsn: Lsn, upsert_fn: Option<UpsertFn>) -> Self {
        Self {
            inner: iter.double_ended_peekable(),
            vlsn,
            upsert_fn,
        }
    }

    fn drain_key_min(&mut self, key: &UserKey) -> crate::Result<()> {
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
}

impl<I: DoubleEndedIterator<Item = crate::Result<Record>>> Iterator for VisibilityStream<I> {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let head = fail_iter!(self.inner.next()?);

            // Versions above the horizon are invisible; the next entry of
            // the same key (if any) is older and may be visible
            if head.key.lsn > self.vlsn {
                continue;
            }

            if head.key.kind == ValueKind::Upsert {
                // Gather the upsert run plus its base before draining
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

                    let next = fail_iter!(next);
                    let is_base = next.key.kind != ValueKind::Upsert;
                    chain.push(next);

                    if is_base {
                        break;
                    }
                }

                let folded = crate::upsert::fold(self.upsert_fn.as_ref(), &chain);

                let key = chain.swap_remove(0).key.user_key;
                fail_iter!(self.drain_key_min(&key));

                match folded {
                    Some(record) => return Some(Ok(record)),
                    // fully folded away; key is absent
                    None => continue,
                }
            }

            // As long as items are the same key, ignore them
            fail_iter!(self.drain_key_min(&head.key.user_key));

            return Some(Ok(head));
        }
    }
}

impl<I: DoubleEndedIterator<Item = crate::Result<Record>>> DoubleEndedIterator
    for VisibilityStream<I>
{
    fn next_back(&mut self) -> Option<Self::Item> {
        loop {
            let tail = fail_iter!(self.inner.next_back()?);

            // Collect the whole key run; reversed order yields the oldest
            // version first
            let mut versions = vec![tail];

            loop {
                let Some(prev) = ({
                    let key = &versions[0].key.user_key;
                    self.inner.next_back_if(key)
                }) else {
                    break;
                };

                versions.push(fail_iter!(prev));
            }

            // newest-first, as the fold helper expects
            versions.reverse();

            // skip versions above the horizon
            let visible_from = versions.iter().position(|r| r.key.lsn <= self.vlsn);

            let Some(visible_from) = visible_from else {
                continue;
            };

            #[allow(clippy::indexing_slicing)]
            let chain = &versions[visible_from..];

            let upto = chain
                .iter()
                .position(|r| r.key.kind != ValueKind::Upsert)
                .map_or(chain.len(), |idx| idx + 1);

            #[allow(clippy::indexing_slicing)]
            match crate::upsert::fold(self.upsert_fn.as_ref(), &chain[..upto]) {
                Some(record) => return Some(Ok(record)),
                None => {
                    // only tombstones were visible; emit them so shadowing
                    // still works against older sources
                    if chain.first().is_some_and(Record::is_tombstone) {
                        return Some(Ok(chain[0].clone()));
                    }

                    continue;
                }
            }
        }
    }
}

// Small extension so the reverse path reads like the forward one
trait NextBackIf {
    fn next_back_if(&mut self, key: &UserKey) -> Option<crate::Result<Record>>;
}

impl<I: DoubleEndedIterator<Item = crate::Result<Record>>> NextBackIf
    for DoubleEndedPeekable<I>
{
    fn next_back_if(&mut self, key: &UserKey) -> Option<crate::Result<Record>> {
        let matches = match self.peek_back() {
            Some(Ok(kv)) => kv.key.user_key == key,
            Some(Err(_)) => true,
            None => false,
        };

        if matches {
            self.next_back()
        } else {
            None
        }
    }
}
