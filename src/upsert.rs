// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Record, UserValue, ValueKind};
use std::sync::Arc;

/// User-supplied merge function for upsert records
///
/// Called as `(key, existing, delta)`; `existing` is `None` when there is
/// no older visible value. Returning `None` makes the key absent.
pub type UpsertFn =
    Arc<dyn Fn(&[u8], Option<&[u8]>, &[u8]) -> Option<UserValue> + Send + Sync>;

/// Folds a visible version chain into at most one record.
///
/// `chain` is newest-first: zero or more upserts followed by at most one
/// base record (value or tombstone). Deltas apply oldest to newest, seeded
/// by the base value. The result carries the chain head's LSN.
///
/// Without a registered upsert function, the newest delta simply wins,
/// behaving like a plain set.
pub fn fold(upsert_fn: Option<&UpsertFn>, chain: &[Record]) -> Option<Record> {
    let head = chain.first()?;

    if head.key.kind != ValueKind::Upsert {
        return if head.is_tombstone() {
            None
        } else {
            Some(head.clone())
        };
    }

    let Some(upsert_fn) = upsert_fn else {
        return Some(Record {
            key: crate::key::InternalKey::new(
                head.key.user_key.clone(),
                head.key.lsn,
                ValueKind::Value,
            ),
            value: head.value.clone(),
            timestamp: head.timestamp,
        });
    };

    let (base, deltas) = match chain.last() {
        Some(last) if last.key.kind != ValueKind::Upsert => {
            let base = if last.is_tombstone() {
                None
            } else {
                Some(last.value.clone())
            };

            #[allow(clippy::indexing_slicing)]
            (base, &chain[..chain.len() - 1])
        }
        _ => (None, chain),
    };

    let mut acc: Option<UserValue> = base;

    for delta in deltas.iter().rev() {
        acc = upsert_fn(&head.key.user_key, acc.as_deref(), &delta.value);
    }

    acc.map(|value| Record {
        key: crate::key::InternalKey::new(
            head.key.user_key.clone(),
            head.key.lsn,
            ValueKind::Value,
        ),
        value,
        timestamp: head.timestamp,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{Slice, ValueKind};
    use test_log::test;

    fn concat() -> UpsertFn {
        Arc::new(|_key, existing, delta| {
            let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
            out.extend_from_slice(delta);
            Some(Slice::from(out))
        })
    }

    #[test]
    fn fold_concat_without_base() {
        let chain = vec![
            Record::new_upsert(b"k".to_vec(), b"C".to_vec(), 3),
            Record::new_upsert(b"k".to_vec(), b"B".to_vec(), 2),
            Record::new_upsert(b"k".to_vec(), b"A".to_vec(), 1),
        ];

        let out = fold(Some(&concat()), &chain).unwrap();
        assert_eq!(b"ABC", &*out.value);
        assert_eq!(3, out.key.lsn);
        assert_eq!(ValueKind::Value, out.key.kind);
    }

    #[test]
    fn fold_concat_with_base() {
        let chain = vec![
            Record::new_upsert(b"k".to_vec(), b"B".to_vec(), 3),
            Record::from_components(b"k".to_vec(), b"A".to_vec(), 1, ValueKind::Value),
        ];

        let out = fold(Some(&concat()), &chain).unwrap();
        assert_eq!(b"AB", &*out.value);
    }

    #[test]
    fn fold_tombstone_base_resets() {
        let chain = vec![
            Record::new_upsert(b"k".to_vec(), b"B".to_vec(), 3),
            Record::new_tombstone(b"k".to_vec(), 2),
        ];

        let out = fold(Some(&concat()), &chain).unwrap();
        assert_eq!(b"B", &*out.value);
    }

    #[test]
    fn fold_plain_tombstone_is_absent() {
        let chain = vec![Record::new_tombstone(b"k".to_vec(), 2)];
        assert!(fold(Some(&concat()), &chain).is_none());
    }

    #[test]
    fn fold_without_operator_newest_delta_wins() {
        let chain = vec![
            Record::new_upsert(b"k".to_vec(), b"B".to_vec(), 3),
            Record::new_upsert(b"k".to_vec(), b"A".to_vec(), 1),
        ];

        let out = fold(None, &chain).unwrap();
        assert_eq!(b"B", &*out.value);
        assert_eq!(ValueKind::Value, out.key.kind);
    }
}
