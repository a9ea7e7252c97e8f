// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cursor::{Cursor, Order},
    db::{Database, DatabaseStats},
    key::InternalKey,
    schema::{FieldValue, Schema},
    upsert::UpsertFn,
    Env, Lsn, Record, Slice, UserValue, ValueKind,
};
use std::sync::Arc;

/// A database handle: the environment plus one database
///
/// Cheap to clone. All single-statement operations commit implicitly;
/// use [`Env::begin`] for multi-statement transactions.
#[derive(Clone)]
pub struct DatabaseHandle {
    env: Env,
    db: Arc<Database>,
}

impl DatabaseHandle {
    pub(crate) fn new(env: Env, db: Arc<Database>) -> Self {
        Self { env, db }
    }

    pub(crate) fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// The database's schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.db.schema
    }

    /// Registers the merge function folding this database's upserts.
    pub fn register_upsert(&self, upsert_fn: UpsertFn) {
        self.db.register_upsert(upsert_fn);
    }

    fn build_record(&self, values: &[FieldValue], kind: ValueKind) -> crate::Result<Record> {
        let payload = self.db.schema.encode_record(values)?;
        let key = self.db.schema.extract_key(&payload)?;

        Ok(Record {
            key: InternalKey::new(key, 0, kind),
            value: payload,
            timestamp: crate::time::unix_timestamp_secs(),
        })
    }

    fn build_tombstone(&self, key_values: &[FieldValue]) -> crate::Result<Record> {
        let key = self.db.schema.encode_key(key_values)?;

        Ok(Record {
            key: InternalKey::new(key, 0, ValueKind::Tombstone),
            value: Slice::empty(),
            timestamp: crate::time::unix_timestamp_secs(),
        })
    }

    /// Sets a record (all fields, in declaration order); implicit
    /// commit.
    pub fn set(&self, values: &[FieldValue]) -> crate::Result<Lsn> {
        let record = self.build_record(values, ValueKind::Value)?;
        self.env.write_single(&self.db, record)
    }

    /// Issues an upsert; the registered merge function folds it on read
    /// or compaction.
    pub fn upsert(&self, values: &[FieldValue]) -> crate::Result<Lsn> {
        let record = self.build_record(values, ValueKind::Upsert)?;
        self.env.write_single(&self.db, record)
    }

    /// Deletes a key (key fields, in key order); implicit commit.
    pub fn delete(&self, key_values: &[FieldValue]) -> crate::Result<Lsn> {
        let record = self.build_tombstone(key_values)?;
        self.env.write_single(&self.db, record)
    }

    /// Point read at the current LSN; returns the record payload.
    pub fn get(&self, key_values: &[FieldValue]) -> crate::Result<Option<UserValue>> {
        let key = self.db.schema.encode_key(key_values)?;

        Ok(self
            .env
            .get_at(&self.db, &key, self.env.lsn())?
            .map(|record| record.value))
    }

    /// Opens a range cursor at the current LSN.
    ///
    /// `key_values` positions the cursor; `prefix` (leading bytes of the
    /// first key field) clamps the scan. A cursor with an empty prefix is
    /// an unconstrained scan.
    pub fn cursor(
        &self,
        order: Order,
        key_values: Option<&[FieldValue]>,
        prefix: Option<&[u8]>,
    ) -> crate::Result<Cursor> {
        let key = key_values
            .map(|values| self.db.schema.encode_key(values))
            .transpose()?;

        let prefix = match prefix {
            Some(prefix) if !prefix.is_empty() => {
                Some(self.db.schema.encode_prefix(prefix)?)
            }
            _ => None,
        };

        Ok(Cursor::build(
            &self.env,
            &self.db,
            self.env.lsn(),
            order,
            key,
            prefix,
            true,
        ))
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> DatabaseStats {
        self.db.stats()
    }

    /// Synchronously flushes the memory indices to disk branches.
    pub fn flush(&self) -> crate::Result<()> {
        self.env.flush(&self.db)
    }

    /// Synchronously merges all branches.
    pub fn compact(&self) -> crate::Result<()> {
        self.env.compact(&self.db)
    }

    /// Synchronously runs a TTL expiry pass.
    pub fn expire(&self) -> crate::Result<()> {
        self.env.expire(&self.db)
    }

    /// Writes the snapshot fastpath file, accelerating the next open.
    pub fn snapshot(&self) -> crate::Result<()> {
        self.env.snapshot(&self.db)
    }
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatabaseHandle({:?})", self.db.name)
    }
}
