// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The MVCC concurrency manager
//!
//! Tracks, per database, a chain of in-flight version cells per user key,
//! orders commits through a global commit sequence (`csn`), detects
//! write-write and read-write conflicts, and garbage-collects committed
//! read markers once no concurrent transaction can be affected by them.
//!
//! Conflict and lock outcomes are first-class values, never errors.

pub mod transaction;

pub use transaction::{Transaction, TxKind, TxState};

use crate::{lsn::LsnCounter, Lsn, Record, UserKey, ValueKind};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Transaction identifier (`tsn`)
pub type TxId = u64;

/// Commit sequence number
pub type Csn = u64;

/// Database identifier within one environment
pub type DbId = u32;

/// Outcome of a commit attempt
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommitOutcome {
    /// All writes are committed and stamped with this LSN.
    Committed(Lsn),

    /// The transaction lost a conflict and was rolled back; re-run it.
    Conflict,

    /// A concurrent uncommitted writer owns an earlier version of some
    /// key; wait for it to finish (and check for deadlock), then retry.
    Lock,
}

/// What a committing transaction decides about an uncommitted reader
/// underneath one of its writes (the prepare hook)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrepareDecision {
    Proceed,
    Abort,
}

/// Result of walking the transaction log before a commit
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrepareOutcome {
    /// Every cell is preparable
    Ready,

    /// An uncommitted writer owns an earlier version of some key
    Lock,

    /// The transaction must roll back
    Conflict,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CellKind {
    Write,
    Get,
}

struct Cell {
    tx: TxId,
    kind: CellKind,
    record: Record,
    csn: Option<Csn>,
    conflict: bool,
}

struct TxSlot {
    csn_begin: Csn,
    conflict: bool,
    state: TxState,
}

struct GcEntry {
    csn: Csn,
    db: DbId,
    key: UserKey,
    tx: TxId,
}

type ChainKey = (DbId, UserKey);

#[derive(Default)]
struct Inner {
    /// One entry per user key with any uncommitted activity; cells are
    /// ordered oldest to newest
    chains: BTreeMap<ChainKey, Vec<Cell>>,

    /// Active read-write transactions
    slots: FxHashMap<TxId, TxSlot>,

    /// Committed GET cells retained for read-write conflict detection
    gc: Vec<GcEntry>,
}

/// The per-environment transaction manager
///
/// One mutex guards the transaction tables and the committed-GET gc list.
pub struct TxManager {
    tsn: LsnCounter,
    csn: LsnCounter,
    inner: Mutex<Inner>,
}

impl Default for TxManager {
    fn default() -> Self {
        Self {
            tsn: LsnCounter::default(),
            csn: LsnCounter::default(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl TxManager {
    /// Begins a transaction, freezing its visibility horizon.
    ///
    /// `vlsn` defaults to the current LSN unless the caller passes an
    /// explicit horizon. The current `csn` becomes the transaction's
    /// conflict epoch.
    pub fn begin(&self, kind: TxKind, vlsn: Option<Lsn>, current_lsn: Lsn) -> Transaction {
        let id = self.tsn.next();
        let csn_begin = self.csn.get();

        if kind == TxKind::ReadWrite {
            #[allow(clippy::expect_used)]
            self.inner.lock().expect("lock is poisoned").slots.insert(
                id,
                TxSlot {
                    csn_begin,
                    conflict: false,
                    state: TxState::Ready,
                },
            );
        }

        Transaction::new(id, kind, vlsn.unwrap_or(current_lsn), csn_begin)
    }

    /// Installs (or replaces) this transaction's pending write for a key.
    ///
    /// A second *upsert* statement on the same key within one transaction
    /// is a caller error; plain sets and deletes replace the earlier
    /// statement.
    pub fn set(
        &self,
        tx: &mut Transaction,
        db: DbId,
        key: UserKey,
        record: Record,
    ) -> crate::Result<()> {
        if tx.kind != TxKind::ReadWrite {
            return Err(crate::Error::BadRequest(
                "cannot write in a read-only transaction",
            ));
        }

        if tx.state != TxState::Ready {
            return Err(crate::Error::BadRequest(
                "cannot write in a prepared or finished transaction",
            ));
        }

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let chain = inner.chains.entry((db, key.clone())).or_default();

        let own = chain
            .iter_mut()
            .find(|cell| cell.tx == tx.id && cell.kind == CellKind::Write);

        if let Some(cell) = own {
            if record.key.kind == ValueKind::Upsert {
                return Err(crate::Error::BadRequest(
                    "upsert may not overwrite an earlier statement on the same key",
                ));
            }

            cell.record = record;
            return Ok(());
        }

        chain.push(Cell {
            tx: tx.id,
            kind: CellKind::Write,
            record,
            csn: None,
            conflict: false,
        });

        tx.log_write(db, key);
        Ok(())
    }

    /// Transactional read.
    ///
    /// Returns this transaction's own pending record for the key if it
    /// has one. Otherwise a GET cell is attached to the chain for
    /// conflict tracking and `None` is returned; the caller then serves
    /// the read from the database at the transaction's `vlsn`.
    ///
    /// Read-only transactions never appear in version chains.
    pub fn get(&self, tx: &mut Transaction, db: DbId, key: &UserKey) -> Option<Record> {
        if tx.kind == TxKind::ReadOnly {
            return None;
        }

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if let Some(chain) = inner.chains.get(&(db, key.clone())) {
            if let Some(cell) = chain
                .iter()
                .rev()
                .find(|cell| cell.tx == tx.id && cell.kind == CellKind::Write)
            {
                return Some(cell.record.clone());
            }
        }

        // marker record; only the key matters for conflict tracking
        let marker = Record {
            key: crate::key::InternalKey {
                user_key: key.clone(),
                lsn: 0,
                kind: ValueKind::Value,
            },
            value: crate::Slice::empty(),
            timestamp: 0,
        };

        let already_reading = inner
            .chains
            .get(&(db, key.clone()))
            .is_some_and(|chain| {
                chain
                    .iter()
                    .any(|cell| cell.tx == tx.id && cell.kind == CellKind::Get)
            });

        if !already_reading {
            inner.chains.entry((db, key.clone())).or_default().push(Cell {
                tx: tx.id,
                kind: CellKind::Get,
                record: marker,
                csn: None,
                conflict: false,
            });

            tx.log_read(db, key.clone());
        }

        None
    }

    /// Walks the transaction log and decides whether the transaction can
    /// commit.
    ///
    /// `hook` is consulted when a pending write sits on top of another
    /// transaction's uncommitted read.
    pub fn prepare(
        &self,
        tx: &Transaction,
        hook: impl Fn(TxId) -> PrepareDecision,
    ) -> PrepareOutcome {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");

        self.prepare_locked(&inner, tx, &hook)
    }

    fn prepare_locked(
        &self,
        inner: &Inner,
        tx: &Transaction,
        hook: &impl Fn(TxId) -> PrepareDecision,
    ) -> PrepareOutcome {
        if inner.slots.get(&tx.id).is_some_and(|slot| slot.conflict) {
            return PrepareOutcome::Conflict;
        }

        // Fastpath: no transaction committed since this one began, so
        // nothing can conflict
        if tx.csn_begin == self.csn.get() {
            return PrepareOutcome::Ready;
        }

        for op in tx.log() {
            let Some(chain) = inner.chains.get(&(op.db, op.key.clone())) else {
                continue;
            };

            let wanted = if op.write {
                CellKind::Write
            } else {
                CellKind::Get
            };

            let Some(own_pos) = chain
                .iter()
                .position(|cell| cell.tx == tx.id && cell.kind == wanted)
            else {
                continue;
            };

            #[allow(clippy::indexing_slicing)]
            let own = &chain[own_pos];

            if own.conflict {
                return PrepareOutcome::Conflict;
            }

            if own_pos == 0 {
                continue;
            }

            #[allow(clippy::indexing_slicing)]
            let pred = &chain[own_pos - 1];

            match (pred.csn, pred.kind) {
                // a committed predecessor younger than our epoch is a
                // write-write conflict
                (Some(csn), _) if csn > tx.csn_begin => return PrepareOutcome::Conflict,
                (Some(_), _) => {}
                (None, CellKind::Write) => return PrepareOutcome::Lock,
                (None, CellKind::Get) => {
                    if pred.tx != tx.id && hook(pred.tx) == PrepareDecision::Abort {
                        return PrepareOutcome::Conflict;
                    }
                }
            }
        }

        PrepareOutcome::Ready
    }

    /// Commits the transaction: aborts conflicting readers and later
    /// writers, stamps every pending write with `lsn`, unlinks write
    /// cells and retains GET cells for gc.
    ///
    /// On `Conflict` the transaction is rolled back internally.
    pub fn commit(
        &self,
        tx: &mut Transaction,
        lsn: Lsn,
        hook: impl Fn(TxId) -> PrepareDecision,
    ) -> (CommitOutcome, Vec<(DbId, Record)>) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        match self.prepare_locked(&inner, tx, &hook) {
            PrepareOutcome::Lock => return (CommitOutcome::Lock, vec![]),
            PrepareOutcome::Conflict => {
                Self::rollback_locked(&mut inner, tx);
                return (CommitOutcome::Conflict, vec![]);
            }
            PrepareOutcome::Ready => {}
        }

        let csn = self.csn.next();
        let mut writes = vec![];

        let Inner { chains, slots, gc } = &mut *inner;

        for op in tx.log() {
            let Some(chain) = chains.get_mut(&(op.db, op.key.clone())) else {
                continue;
            };

            let wanted = if op.write {
                CellKind::Write
            } else {
                CellKind::Get
            };

            let Some(own_pos) = chain
                .iter()
                .position(|cell| cell.tx == tx.id && cell.kind == wanted)
            else {
                continue;
            };

            if op.write {
                // First committer wins: abort every concurrent
                // uncommitted reader of this key and every other
                // uncommitted writer, regardless of chain position
                for cell in chain.iter_mut() {
                    if cell.tx == tx.id || cell.csn.is_some() {
                        continue;
                    }

                    cell.conflict = true;

                    if let Some(slot) = slots.get_mut(&cell.tx) {
                        slot.conflict = true;
                    }
                }

                let mut record = chain.remove(own_pos).record;
                record.key.lsn = lsn;
                writes.push((op.db, record));
            } else {
                #[allow(clippy::indexing_slicing)]
                let cell = &mut chain[own_pos];
                cell.csn = Some(csn);

                gc.push(GcEntry {
                    csn,
                    db: op.db,
                    key: op.key.clone(),
                    tx: tx.id,
                });
            }

            if chains
                .get(&(op.db, op.key.clone()))
                .is_some_and(Vec::is_empty)
            {
                chains.remove(&(op.db, op.key.clone()));
            }
        }

        slots.remove(&tx.id);
        tx.finish(TxState::Commit);

        (CommitOutcome::Committed(lsn), writes)
    }

    /// Unlinks every cell of the transaction and releases its records.
    pub fn rollback(&self, tx: &mut Transaction) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        Self::rollback_locked(&mut inner, tx);
    }

    fn rollback_locked(inner: &mut Inner, tx: &mut Transaction) {
        for op in tx.log() {
            if let Some(chain) = inner.chains.get_mut(&(op.db, op.key.clone())) {
                chain.retain(|cell| cell.tx != tx.id || cell.csn.is_some());

                if chain.is_empty() {
                    inner.chains.remove(&(op.db, op.key.clone()));
                }
            }
        }

        inner.slots.remove(&tx.id);
        tx.finish(TxState::Rollback);
    }

    /// Walks "waited-on" edges from `tx` and reports whether waiting for
    /// them would deadlock.
    ///
    /// Transactions in `Prepare` state (half-committed: already removed
    /// from the chains but not yet finished) are ignored by the walk.
    #[must_use]
    pub fn deadlock_walk(&self, tx: &Transaction) -> bool {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");

        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![tx.id];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }

            for (_, chain) in inner.chains.iter() {
                let Some(own_pos) = chain.iter().position(|cell| cell.tx == current) else {
                    continue;
                };

                if own_pos == 0 {
                    continue;
                }

                #[allow(clippy::indexing_slicing)]
                let pred = &chain[own_pos - 1];

                if pred.csn.is_some() || pred.kind != CellKind::Write {
                    continue;
                }

                if inner
                    .slots
                    .get(&pred.tx)
                    .is_some_and(|slot| slot.state == TxState::Prepare)
                {
                    continue;
                }

                if pred.tx == tx.id {
                    return true;
                }

                stack.push(pred.tx);
            }
        }

        false
    }

    /// Reaps committed GET cells no active transaction can conflict
    /// with anymore.
    pub fn reap_gc(&self) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let min_active = inner
            .slots
            .values()
            .map(|slot| slot.csn_begin)
            .min()
            .unwrap_or(Csn::MAX);

        let Inner { chains, gc, .. } = &mut *inner;

        gc.retain(|entry| {
            if entry.csn > min_active {
                return true;
            }

            if let Some(chain) = chains.get_mut(&(entry.db, entry.key.clone())) {
                chain.retain(|cell| !(cell.tx == entry.tx && cell.kind == CellKind::Get));

                if chain.is_empty() {
                    chains.remove(&(entry.db, entry.key.clone()));
                }
            }

            false
        });
    }

    /// Number of keys with in-flight activity, for introspection.
    #[must_use]
    pub fn chain_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock is poisoned").chains.len()
    }

    /// Marks a transaction as half-committed (prepared, removed from
    /// consideration by the deadlock walker).
    pub fn mark_prepared(&self, tx: &mut Transaction) {
        #[allow(clippy::expect_used)]
        if let Some(slot) = self
            .inner
            .lock()
            .expect("lock is poisoned")
            .slots
            .get_mut(&tx.id)
        {
            slot.state = TxState::Prepare;
        }

        tx.finish(TxState::Prepare);
    }
}
