// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    Lsn, UserKey, ValueKind,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Key of a versioned record: user key, LSN, record kind
///
/// Sorts by user key first and then by *descending* LSN, which is what
/// turns every sorted stream in the engine (memory index, pages, merges)
/// into contiguous per-key version chains led by their newest version.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: UserKey,
    pub lsn: Lsn,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new<K: Into<UserKey>>(user_key: K, lsn: Lsn, kind: ValueKind) -> Self {
        let user_key = user_key.into();

        assert!(
            user_key.len() <= usize::from(u16::MAX),
            "user keys are limited to u16::MAX bytes",
        );

        Self {
            user_key,
            lsn,
            kind,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == ValueKind::Tombstone
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // within one user key the higher LSN sorts first, so a key's
        // chain head always leads its run
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.lsn.cmp(&self.lsn))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ValueKind::Value => 'V',
            ValueKind::Tombstone => 'T',
            ValueKind::Upsert => 'U',
        };

        write!(f, "{:?}:{}:{kind}", self.user_key, self.lsn)
    }
}

impl Encode for InternalKey {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // the constructor bounds key length to u16
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.user_key.len() as u16)?;
        writer.write_all(&self.user_key)?;

        writer.write_u64::<BigEndian>(self.lsn)?;
        writer.write_u8(u8::from(self.kind))?;

        Ok(())
    }
}

impl Decode for InternalKey {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_len = reader.read_u16::<BigEndian>()?;
        let mut user_key = vec![0; key_len.into()];
        reader.read_exact(&mut user_key)?;

        let lsn = reader.read_u64::<BigEndian>()?;

        let kind = reader.read_u8()?;
        let kind = ValueKind::try_from(kind)
            .map_err(|()| DecodeError::InvalidTag(("ValueKind", kind)))?;

        Ok(Self::new(user_key, lsn, kind))
    }
}
