// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Csn, DbId, TxId};
use crate::{Lsn, UserKey};

/// Read-only or read-write
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxKind {
    /// Sees a consistent snapshot pinned at its `vlsn`; never appears in
    /// version chains and never conflicts
    ReadOnly,

    /// Participates in conflict detection
    ReadWrite,
}

/// Lifecycle state of a transaction
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxState {
    /// Accepting operations
    Ready,

    /// Blocked on an uncommitted predecessor
    Lock,

    /// Half-committed: prepared and removed from consideration by the
    /// deadlock walker, but not yet committed or rolled back
    Prepare,

    Commit,
    Rollback,
}

/// One entry of a transaction's operation log
#[derive(Clone, Debug)]
pub struct TxOp {
    pub db: DbId,
    pub key: UserKey,

    /// `true` for a pending write cell, `false` for a GET marker
    pub write: bool,
}

/// An in-flight transaction
///
/// The LSN of every record in the log is stamped only on successful
/// commit; until then pending records carry LSN 0.
pub struct Transaction {
    pub id: TxId,
    pub kind: TxKind,

    /// Visibility horizon: versions with LSN > `vlsn` are invisible
    pub vlsn: Lsn,

    /// Commit-sequence epoch captured at begin, the base line for
    /// conflict detection
    pub csn_begin: Csn,

    pub state: TxState,

    log: Vec<TxOp>,
}

impl Transaction {
    pub(super) fn new(id: TxId, kind: TxKind, vlsn: Lsn, csn_begin: Csn) -> Self {
        Self {
            id,
            kind,
            vlsn,
            csn_begin,
            state: TxState::Ready,
            log: vec![],
        }
    }

    pub(super) fn log_write(&mut self, db: DbId, key: UserKey) {
        self.log.push(TxOp {
            db,
            key,
            write: true,
        });
    }

    pub(super) fn log_read(&mut self, db: DbId, key: UserKey) {
        self.log.push(TxOp {
            db,
            key,
            write: false,
        });
    }

    /// The operation log, in statement order.
    #[must_use]
    pub fn log(&self) -> &[TxOp] {
        &self.log
    }

    /// Number of pending writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.log.iter().filter(|op| op.write).count()
    }

    pub(super) fn finish(&mut self, state: TxState) {
        self.state = state;
    }

    /// Whether the transaction is still accepting operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, TxState::Ready | TxState::Lock)
    }

    /// Whether the transaction can still commit or roll back (active, or
    /// half-committed via prepare).
    #[must_use]
    pub fn can_finish(&self) -> bool {
        matches!(self.state, TxState::Ready | TxState::Lock | TxState::Prepare)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Transaction {{ id: {}, kind: {:?}, vlsn: {}, state: {:?}, ops: {} }}",
            self.id,
            self.kind,
            self.vlsn,
            self.state,
            self.log.len(),
        )
    }
}
