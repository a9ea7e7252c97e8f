// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embeddable transactional key-value storage engine built on a
//! log-structured merge design with per-key MVCC.
//!
//! An embedding process opens an [`Env`], declares one or more databases
//! (each with its own typed key [`Schema`]), then issues point reads,
//! range cursors and transactions:
//!
//! - durable ordered storage for composite byte keys with sorted range
//!   scans,
//! - snapshot-isolated transactions with first-committer-wins conflict
//!   detection,
//! - a write-ahead log binding every commit to a durable LSN,
//! - background branching, compaction, TTL expiry, checkpoints,
//!   snapshots and backups driven by a worker pool.
//!
//! # Example usage
//!
//! ```
//! use tundra::{Config, FieldType, FieldValue, Schema, Slice};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let env = Config::new(&folder).open()?;
//!
//! let db = env.database(
//!     Schema::builder("users")
//!         .key_field("id", FieldType::Bytes, 0)
//!         .field("name", FieldType::Bytes)
//!         .build()?,
//! )?;
//!
//! db.set(&[
//!     FieldValue::Bytes(Slice::from("u1")),
//!     FieldValue::Bytes(Slice::from("alice")),
//! ])?;
//!
//! let payload = db.get(&[FieldValue::Bytes(Slice::from("u1"))])?;
//! assert!(payload.is_some());
//!
//! // Transactions are snapshot-isolated; conflicts are values, not
//! // errors
//! let mut tx = env.begin();
//! tx.set(&db, &[
//!     FieldValue::Bytes(Slice::from("u2")),
//!     FieldValue::Bytes(Slice::from("bob")),
//! ])?;
//! tx.commit()?;
//! #
//! # env.close();
//! # Ok::<(), tundra::Error>(())
//! ```

// unsafe is denied, not forbidden: the one exception is the
// uninitialized pread buffer in file::read_exact_at
#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod branch;
mod checksum;

#[doc(hidden)]
pub mod coding;

mod compression;
mod config;
mod cursor;
mod db;
mod double_ended_peekable;
mod env;
mod error;

#[doc(hidden)]
pub mod file;

mod format_version;

mod handle;
mod key;
mod lsn;

#[doc(hidden)]
pub mod memindex;

#[doc(hidden)]
pub mod merge;

mod mvcc;
mod node;
mod page;
mod quota;

#[doc(hidden)]
pub mod read_stream;

mod schema;
mod scheduler;
mod slice;
mod snapshot_file;
mod time;
mod tree;
mod tx;
mod upsert;
mod value;
mod view;
mod wal;

#[doc(hidden)]
pub mod write_stream;

#[doc(hidden)]
pub use {
    branch::{
        writer::{BranchWriter, Options as BranchWriterOptions},
        Branch,
    },
    key::InternalKey,
    lsn::LsnCounter,
    merge::BoxedIterator,
    node::{Node, PageCache},
    page::{writer::PageBuilder, Page},
};

pub use {
    compression::CompressionType,
    config::{CompactMode, Config},
    cursor::{Cursor, Order},
    db::{DatabaseStats, DbStatus},
    env::Env,
    error::{Error, Result},
    format_version::FormatVersion,
    handle::DatabaseHandle,
    mvcc::{CommitOutcome, PrepareOutcome, TxKind},
    schema::{Field, FieldType, FieldValue, Schema, SchemaBuilder},
    slice::Slice,
    tx::Tx,
    upsert::UpsertFn,
    value::{Lsn, Record, UserKey, UserValue, ValueKind},
    view::View,
    wal::{Durability, RecoveryMode},
};

pub use checksum::Checksum;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);
