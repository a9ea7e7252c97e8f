// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::InternalKey, Slice};

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Log sequence number, the engine's monotonic version counter
///
/// Every write of one committed transaction carries the same LSN, and a
/// record shadows any record of the same user key with a lower LSN; this
/// is what MVCC visibility filters on. Obsolete versions are reaped
/// lazily by branching and compaction.
pub type Lsn = u64;

/// Kind of a record (regular value, tombstone, or pending upsert)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueKind {
    /// Existing value
    Value,

    /// Deleted value
    ///
    /// Deletes stay logical records with an empty value so that LSN
    /// ordering is preserved.
    Tombstone,

    /// Pending user-supplied merge on this key; folded by the read and
    /// write iterators
    Upsert,
}

impl TryFrom<u8> for ValueKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            2 => Ok(Self::Upsert),
            _ => Err(()),
        }
    }
}

impl From<ValueKind> for u8 {
    fn from(value: ValueKind) -> Self {
        match value {
            ValueKind::Value => 0,
            ValueKind::Tombstone => 1,
            ValueKind::Upsert => 2,
        }
    }
}

/// One stored version: internal key, schema-formatted payload, wall-clock
/// timestamp
///
/// The timestamp (unix seconds) drives TTL expiry. The payload is shared
/// by refcount wherever the record travels (memory indices, MVCC cells,
/// WAL batches, task buffers).
#[derive(Clone, Eq)]
pub struct Record {
    pub key: InternalKey,

    /// Payload; up to 2^32 bytes
    pub value: UserValue,

    pub timestamp: u32,
}

impl Record {
    /// Creates a record from an already-built internal key.
    ///
    /// # Panics
    ///
    /// Panics on an empty user key or a payload past the 32-bit length
    /// limit.
    pub fn new<V: Into<UserValue>>(key: InternalKey, value: V, timestamp: u32) -> Self {
        let value = value.into();

        assert!(!key.user_key.is_empty(), "records require a user key");
        assert!(
            u32::try_from(value.len()).is_ok(),
            "payload exceeds the 32-bit length limit",
        );

        Self {
            key,
            value,
            timestamp,
        }
    }

    /// Creates a record from its parts, stamped with the current time.
    pub fn from_components<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        lsn: Lsn,
        kind: ValueKind,
    ) -> Self {
        Self::new(
            InternalKey::new(user_key, lsn, kind),
            value,
            crate::time::unix_timestamp_secs(),
        )
    }

    /// Creates a delete marker.
    pub fn new_tombstone<K: Into<UserKey>>(key: K, lsn: Lsn) -> Self {
        Self::from_components(key, vec![], lsn, ValueKind::Tombstone)
    }

    /// Creates a pending upsert delta.
    pub fn new_upsert<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V, lsn: Lsn) -> Self {
        Self::from_components(key, value, lsn, ValueKind::Upsert)
    }

    #[doc(hidden)]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.key.is_tombstone()
    }

    #[doc(hidden)]
    #[must_use]
    pub fn is_upsert(&self) -> bool {
        self.key.kind == ValueKind::Upsert
    }

    /// Approximate heap footprint, used for quota accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.user_key.len() + self.value.len()
    }
}

// Identity and ordering come from the internal key alone; payload and
// timestamp never participate
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} => ", self.key)?;

        if self.value.len() >= 64 {
            write!(f, "[ ... {} bytes ]", self.value.len())
        } else {
            write!(f, "{:?}", self.value)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn record_identity_ignores_payload() {
        let a = Record::from_components(*b"k", *b"one", 5, ValueKind::Value);
        let b = Record::from_components(*b"k", *b"two", 5, ValueKind::Value);

        assert_eq!(a, b);
        assert_eq!(std::cmp::Ordering::Equal, a.cmp(&b));
    }

    #[test]
    fn record_order_follows_key_order() {
        let newer = Record::from_components(*b"k", *b"x", 9, ValueKind::Value);
        let older = Record::from_components(*b"k", *b"x", 2, ValueKind::Value);
        let other = Record::from_components(*b"z", *b"x", 1, ValueKind::Value);

        assert!(newer < older);
        assert!(older < other);
    }

    #[test]
    fn tombstone_has_empty_value() {
        let t = Record::new_tombstone(*b"a", 1);

        assert!(t.is_tombstone());
        assert!(t.value.is_empty());
    }
}
