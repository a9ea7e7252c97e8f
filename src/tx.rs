// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cursor::{Cursor, Order},
    handle::DatabaseHandle,
    key::InternalKey,
    mvcc::{CommitOutcome, PrepareOutcome, Transaction},
    schema::FieldValue,
    wal::Durability,
    Env, Record, Slice, UserValue, ValueKind,
};

/// An interactive read-write transaction
///
/// Reads see a consistent snapshot pinned at begin plus the
/// transaction's own writes. A conflicting commit returns
/// [`CommitOutcome::Conflict`] (a value, not an error); re-run the
/// transaction. A transaction dropped without commit rolls back.
pub struct Tx {
    env: Env,
    inner: Transaction,
    durability: Option<Durability>,
    pinned: bool,
}

impl Tx {
    pub(crate) fn new(env: Env, inner: Transaction) -> Self {
        env.pin(inner.vlsn);

        Self {
            env,
            inner,
            durability: None,
            pinned: true,
        }
    }

    /// Overrides the WAL durability of this commit.
    #[must_use]
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = Some(durability);
        self
    }

    fn ensure_active(&self) -> crate::Result<()> {
        if self.inner.is_active() {
            Ok(())
        } else {
            Err(crate::Error::BadRequest(
                "transaction is already finished",
            ))
        }
    }

    fn build_record(
        db: &DatabaseHandle,
        values: &[FieldValue],
        kind: ValueKind,
    ) -> crate::Result<Record> {
        let payload = db.schema().encode_record(values)?;
        let key = db.schema().extract_key(&payload)?;

        Ok(Record {
            key: InternalKey::new(key, 0, kind),
            value: payload,
            timestamp: crate::time::unix_timestamp_secs(),
        })
    }

    /// Stages a set.
    pub fn set(&mut self, db: &DatabaseHandle, values: &[FieldValue]) -> crate::Result<()> {
        self.ensure_active()?;
        db.db().ensure_writable()?;

        let record = Self::build_record(db, values, ValueKind::Value)?;

        self.env.inner.txs.set(
            &mut self.inner,
            db.db().id,
            record.key.user_key.clone(),
            record,
        )
    }

    /// Stages an upsert. A second upsert on the same key in this
    /// transaction is a caller error.
    pub fn upsert(&mut self, db: &DatabaseHandle, values: &[FieldValue]) -> crate::Result<()> {
        self.ensure_active()?;
        db.db().ensure_writable()?;

        let record = Self::build_record(db, values, ValueKind::Upsert)?;

        self.env.inner.txs.set(
            &mut self.inner,
            db.db().id,
            record.key.user_key.clone(),
            record,
        )
    }

    /// Stages a delete.
    pub fn delete(&mut self, db: &DatabaseHandle, key_values: &[FieldValue]) -> crate::Result<()> {
        self.ensure_active()?;
        db.db().ensure_writable()?;

        let key = db.schema().encode_key(key_values)?;

        let record = Record {
            key: InternalKey::new(key.clone(), 0, ValueKind::Tombstone),
            value: Slice::empty(),
            timestamp: crate::time::unix_timestamp_secs(),
        };

        self.env.inner.txs.set(&mut self.inner, db.db().id, key, record)
    }

    /// Transactional read: own writes first, then the snapshot at the
    /// transaction's horizon.
    pub fn get(
        &mut self,
        db: &DatabaseHandle,
        key_values: &[FieldValue],
    ) -> crate::Result<Option<UserValue>> {
        self.ensure_active()?;

        let key = db.schema().encode_key(key_values)?;

        if let Some(own) = self.env.inner.txs.get(&mut self.inner, db.db().id, &key) {
            return match own.key.kind {
                ValueKind::Tombstone => Ok(None),
                ValueKind::Value => Ok(Some(own.value)),
                ValueKind::Upsert => {
                    // fold the pending upsert over the committed state
                    let base = self.env.get_at(db.db(), &key, self.inner.vlsn)?;

                    let mut chain = vec![own];
                    if let Some(base) = base {
                        chain.push(base);
                    }

                    Ok(crate::upsert::fold(db.db().upsert_fn().as_ref(), &chain)
                        .map(|record| record.value))
                }
            };
        }

        Ok(self
            .env
            .get_at(db.db(), &key, self.inner.vlsn)?
            .map(|record| record.value))
    }

    /// Opens a cursor over the transaction's snapshot (own uncommitted
    /// writes are not visible to cursors).
    pub fn cursor(
        &self,
        db: &DatabaseHandle,
        order: Order,
        key_values: Option<&[FieldValue]>,
    ) -> crate::Result<Cursor> {
        let key = key_values
            .map(|values| db.schema().encode_key(values))
            .transpose()?;

        Ok(Cursor::build(
            &self.env,
            db.db(),
            self.inner.vlsn,
            order,
            key,
            None,
            true,
        ))
    }

    /// Walks the transaction log ahead of commit.
    ///
    /// On [`PrepareOutcome::Ready`] the transaction becomes
    /// half-committed: the deadlock walker ignores it, no further
    /// statements are accepted, and only commit or rollback remain.
    pub fn prepare(&mut self) -> crate::Result<PrepareOutcome> {
        self.ensure_active()?;

        let outcome = self
            .env
            .inner
            .txs
            .prepare(&self.inner, |_| crate::mvcc::PrepareDecision::Proceed);

        match outcome {
            PrepareOutcome::Ready => self.env.inner.txs.mark_prepared(&mut self.inner),
            PrepareOutcome::Lock => {}
            PrepareOutcome::Conflict => {
                self.env.rollback_tx(&mut self.inner);
                self.unpin();
            }
        }

        Ok(outcome)
    }

    /// Commits. On [`CommitOutcome::Lock`] the transaction stays usable;
    /// wait for the holder (checking [`Tx::is_deadlocked`]) and retry.
    pub fn commit(&mut self) -> crate::Result<CommitOutcome> {
        if !self.inner.can_finish() {
            return Err(crate::Error::BadRequest(
                "transaction is already finished",
            ));
        }

        let outcome = self.env.commit_tx(&mut self.inner, self.durability)?;

        if outcome != CommitOutcome::Lock {
            self.unpin();
        }

        Ok(outcome)
    }

    /// Rolls the transaction back.
    pub fn rollback(&mut self) {
        if self.inner.can_finish() {
            self.env.rollback_tx(&mut self.inner);
        }

        self.unpin();
    }

    /// Whether waiting on the transactions holding our keys would
    /// deadlock.
    #[must_use]
    pub fn is_deadlocked(&self) -> bool {
        self.env.inner.txs.deadlock_walk(&self.inner)
    }

    /// The transaction's visibility horizon.
    #[must_use]
    pub fn vlsn(&self) -> crate::Lsn {
        self.inner.vlsn
    }

    fn unpin(&mut self) {
        if self.pinned {
            self.env.unpin(self.inner.vlsn);
            self.pinned = false;
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.inner.can_finish() {
            self.env.rollback_tx(&mut self.inner);
        }

        self.unpin();
    }
}
