// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The environment: the single explicit value everything is threaded
//! through
//!
//! Owns the databases, the WAL, the transaction manager, the memory
//! quota, the shared page cache and the background workers. There are no
//! hidden globals; background tasks receive a clone of the handle.

use crate::{
    config::Config,
    db::{Database, DbStatus},
    file::{NodeFileState, DROP_MARKER, LOG_FOLDER, SCHEME_FILE},
    handle::DatabaseHandle,
    lsn::LsnCounter,
    mvcc::{CommitOutcome, DbId, PrepareDecision, Transaction, TxKind, TxManager},
    node::{Node, PageCache},
    quota::Quota,
    schema::Schema,
    tree::Tree,
    tx::Tx,
    view::View,
    wal::{Durability, RecoveryMode, Wal},
    Lsn, Record, Slice,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

pub(crate) struct EnvInner {
    pub config: Config,

    pub databases: RwLock<Vec<Arc<Database>>>,

    pub wal: Option<Wal>,
    pub quota: Quota,
    pub txs: TxManager,

    /// The global LSN; total order matching WAL-append order
    pub lsn: LsnCounter,

    pub page_cache: Arc<PageCache>,

    /// Visibility horizons pinned by open views and transactions;
    /// retention never drops a version some pin can still see
    pub pins: Mutex<BTreeMap<Lsn, usize>>,

    /// Serializes the commit path so LSN order matches append order
    pub commit_lock: Mutex<()>,

    /// Active backup sequence number
    pub backup_seq: LsnCounter,

    /// In-flight backup, if any
    pub backup_state: Mutex<Option<crate::scheduler::task::BackupState>>,

    /// Raised once to make the workers drain and exit
    pub stop: AtomicBool,
    pub workers: Mutex<Vec<std::thread::JoinHandle<()>>>,

    /// Round-robin cursor over databases for the planner
    pub rr: AtomicUsize,
}

/// An open storage environment
///
/// Cheap to clone; all clones share the same state. Dropping the last
/// clone shuts the environment down.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

impl Env {
    /// Opens (and recovers) the environment.
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let wal = if config.wal_enabled {
            Some(Wal::open(
                &config.path.join(LOG_FOLDER),
                config.wal_rotate_watermark,
                config.durability,
            )?)
        } else {
            None
        };

        let mut databases = vec![];
        let mut max_lsn = 0;

        for (name, path) in crate::file::sorted_file_names(&config.path)? {
            if name == LOG_FOLDER || !path.is_dir() {
                continue;
            }

            if !path.join(SCHEME_FILE).exists() {
                continue;
            }

            if path.join(DROP_MARKER).exists() {
                log::info!("dropping database {name:?} (drop marker present)");
                std::fs::remove_dir_all(&path)?;
                continue;
            }

            let db = Self::recover_database(&path)?;

            for node in db.tree.nodes() {
                for branch in node.branches() {
                    max_lsn = max_lsn.max(branch.meta.max_lsn);
                }
            }

            databases.push(db);
        }

        let backup_seq = config
            .backup_path
            .as_deref()
            .and_then(|root| Self::scan_backup_seq(root).ok())
            .unwrap_or(0);

        let env = Self {
            inner: Arc::new(EnvInner {
                quota: Quota::new(config.memory_limit),
                page_cache: Arc::new(PageCache::new(config.page_cache_capacity.max(1))),
                databases: RwLock::new(databases),
                wal,
                txs: TxManager::default(),
                lsn: LsnCounter::new(max_lsn),
                pins: Mutex::new(BTreeMap::new()),
                commit_lock: Mutex::new(()),
                backup_seq: LsnCounter::new(backup_seq),
                backup_state: Mutex::new(None),
                stop: AtomicBool::new(false),
                workers: Mutex::new(vec![]),
                rr: AtomicUsize::new(0),
                config,
            }),
        };

        env.replay_wal()?;

        crate::scheduler::spawn_workers(&env, env.inner.config.worker_threads);

        log::info!(
            "opened environment at {:?} (lsn {}, {} databases)",
            env.inner.config.path,
            env.inner.lsn.get(),
            env.inner.databases.read().map_or(0, |dbs| dbs.len()),
        );

        Ok(env)
    }

    /// Applies the node file-state policy and rebuilds one database.
    fn recover_database(folder: &Path) -> crate::Result<Arc<Database>> {
        let (schema, db_id) = Schema::load(folder)?;

        // Pass 1: classify files and apply the crash-recovery policy per
        // parent: any .incomplete child invalidates all of the parent's
        // children; lone .seal children are promoted and replace the
        // parent; .gc remnants are deleted.
        let mut seals: Vec<(u64, u64, PathBuf)> = vec![];
        let mut doomed: Vec<PathBuf> = vec![];
        let mut invalid_parents = std::collections::HashSet::new();

        for (name, path) in crate::file::sorted_file_names(folder)? {
            match crate::file::parse_node_file_name(&name) {
                Some(NodeFileState::Incomplete { parent, .. }) => {
                    invalid_parents.insert(parent);
                    doomed.push(path);
                }
                Some(NodeFileState::Sealed { parent, id }) => {
                    seals.push((parent, id, path));
                }
                Some(NodeFileState::Remnant { .. }) => doomed.push(path),
                _ => {}
            }
        }

        for path in doomed {
            log::info!("recovery: removing {path:?}");
            std::fs::remove_file(&path)?;
        }

        for (parent, id, path) in seals {
            if invalid_parents.contains(&parent) {
                // a sibling never sealed; the whole compaction output is
                // invalid
                log::info!("recovery: removing {path:?} (incomplete sibling)");
                std::fs::remove_file(&path)?;
                continue;
            }

            let final_path = folder.join(crate::file::node_file_name(id));
            log::info!("recovery: promoting {path:?} -> {final_path:?}");
            crate::file::rename_durable(&path, &final_path)?;

            let parent_path = folder.join(crate::file::node_file_name(parent));
            if parent_path.exists() {
                std::fs::remove_file(&parent_path)?;
            }
        }

        // Pass 2: open surviving node files, via the snapshot fastpath
        // where it still matches
        let snapshot = crate::snapshot_file::read_snapshot(folder)?.unwrap_or_default();

        let mut nodes = vec![];

        for (name, path) in crate::file::sorted_file_names(folder)? {
            let Some(NodeFileState::Complete { id }) = crate::file::parse_node_file_name(&name)
            else {
                continue;
            };

            let entry = snapshot.iter().find(|entry| entry.id == id);

            let node = match entry {
                Some(entry) => match crate::snapshot_file::node_from_snapshot(folder, entry)? {
                    Some(node) => {
                        log::debug!("node {id}: recovered via snapshot fastpath");
                        node
                    }
                    None => Node::open(&path, id, Slice::empty())?,
                },
                None => Node::open(&path, id, Slice::empty())?,
            };

            nodes.push(node);
        }

        // Routing keys are not stored in node files; they are derived
        // from branch contents (the lowest node is re-anchored at the
        // empty key by the tree)
        let mut keyed_nodes = vec![];

        for node in nodes {
            let min_key = node
                .branches()
                .iter()
                .filter_map(|branch| branch.min_key().cloned())
                .min()
                .unwrap_or_else(Slice::empty);

            keyed_nodes.push(if node.routing_key == min_key {
                node
            } else {
                Node::open_with_branches(&node.path, node.id, min_key, node.branches())?
            });
        }

        if keyed_nodes.is_empty() {
            keyed_nodes.push(Node::create(folder, 1, Slice::empty())?);
        }

        let name = schema.name().to_owned();

        Ok(Database::new(
            db_id,
            name,
            schema,
            folder.to_path_buf(),
            Tree::new(keyed_nodes),
        ))
    }

    fn scan_backup_seq(root: &Path) -> crate::Result<u64> {
        if !root.exists() {
            return Ok(0);
        }

        let mut max = 0;

        for (name, _) in crate::file::sorted_file_names(root)? {
            if let Ok(bsn) = name.trim_end_matches(".incomplete").parse::<u64>() {
                max = max.max(bsn);
            }
        }

        Ok(max)
    }

    fn replay_wal(&self) -> crate::Result<()> {
        let Some(wal) = &self.inner.wal else {
            return Ok(());
        };

        match self.inner.config.recovery {
            RecoveryMode::None => {
                wal.reset()?;
                return Ok(());
            }
            // the metadata-only first phase already ran during the
            // directory scan; both modes now replay records
            RecoveryMode::Eager | RecoveryMode::TwoPhase => {}
        }

        let databases = {
            #[allow(clippy::expect_used)]
            self.inner.databases.read().expect("lock is poisoned").clone()
        };

        // Branch flushes cut the LSN space cleanly (the commit path is
        // serialized), so everything at or below a database's highest
        // branch LSN is already durable on disk
        let flushed = databases
            .iter()
            .map(|db| {
                let max = db
                    .tree
                    .nodes()
                    .iter()
                    .flat_map(|node| node.branches())
                    .map(|branch| branch.meta.max_lsn)
                    .max()
                    .unwrap_or(0);

                (db.id, max)
            })
            .collect::<std::collections::HashMap<_, _>>();

        let max_lsn = wal.replay(|db_id, record| {
            let Some(db) = databases.iter().find(|db| db.id == db_id) else {
                log::warn!("wal replay: skipping record for unknown database {db_id}");
                return Ok(());
            };

            if record.key.lsn <= flushed.get(&db.id).copied().unwrap_or(0) {
                return Ok(());
            }

            db.apply(record);
            Ok(())
        })?;

        self.inner.lsn.fetch_max(max_lsn);

        Ok(())
    }

    /// Declares (or re-opens) a database with the given schema.
    pub fn database(&self, schema: Schema) -> crate::Result<DatabaseHandle> {
        #[allow(clippy::expect_used)]
        let mut databases = self.inner.databases.write().expect("lock is poisoned");

        if let Some(db) = databases.iter().find(|db| db.name == schema.name()) {
            if db.schema != schema {
                return Err(crate::Error::BadRequest(
                    "schema does not match the stored one",
                ));
            }

            return Ok(DatabaseHandle::new(self.clone(), db.clone()));
        }

        let id = databases.iter().map(|db| db.id).max().map_or(1, |id| id + 1);

        let folder = self.inner.config.path.join(schema.name());
        std::fs::create_dir_all(&folder)?;

        schema.save(&folder, id)?;

        let node = Node::create(&folder, 1, Slice::empty())?;
        let name = schema.name().to_owned();

        let db = Database::new(id, name, schema, folder, Tree::new(vec![node]));

        databases.push(db.clone());

        log::info!("declared database {:?} (id {id})", db.name);

        Ok(DatabaseHandle::new(self.clone(), db))
    }

    /// Requests a database drop: a marker file is written and the
    /// database stops accepting operations; files are removed at the
    /// next open (or by the drop task).
    pub fn drop_database(&self, name: &str) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let databases = self.inner.databases.read().expect("lock is poisoned");

        let Some(db) = databases.iter().find(|db| db.name == name) else {
            return Err(crate::Error::BadRequest("no such database"));
        };

        std::fs::write(db.path.join(DROP_MARKER), b"")?;
        db.set_status(DbStatus::DropPending);

        Ok(())
    }

    pub(crate) fn databases(&self) -> Vec<Arc<Database>> {
        #[allow(clippy::expect_used)]
        self.inner.databases.read().expect("lock is poisoned").clone()
    }

    /// The current LSN. After any successful commit returning LSN L,
    /// this is ≥ L, even across restart and recovery.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.inner.lsn.get()
    }

    // --- visibility pinning ---

    #[allow(clippy::expect_used)]
    pub(crate) fn pin(&self, vlsn: Lsn) {
        *self
            .inner
            .pins
            .lock()
            .expect("lock is poisoned")
            .entry(vlsn)
            .or_insert(0) += 1;
    }

    pub(crate) fn unpin(&self, vlsn: Lsn) {
        #[allow(clippy::expect_used)]
        let mut pins = self.inner.pins.lock().expect("lock is poisoned");

        if let Some(count) = pins.get_mut(&vlsn) {
            *count -= 1;

            if *count == 0 {
                pins.remove(&vlsn);
            }
        }
    }

    /// The retention watermark: no version visible at or above this
    /// horizon may be dropped by branching or compaction.
    #[must_use]
    pub(crate) fn retention_vlsn(&self) -> Lsn {
        #[allow(clippy::expect_used)]
        let pins = self.inner.pins.lock().expect("lock is poisoned");

        pins.keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.inner.lsn.get())
    }

    // --- transactions ---

    /// Begins an interactive transaction.
    #[must_use]
    pub fn begin(&self) -> Tx {
        Tx::new(
            self.clone(),
            self.inner
                .txs
                .begin(TxKind::ReadWrite, None, self.inner.lsn.get()),
        )
    }

    /// Opens a long-lived read snapshot pinned at the current LSN.
    #[must_use]
    pub fn view(&self) -> View {
        View::new(self.clone(), self.inner.lsn.get())
    }

    /// Commits a transaction: conflict check, LSN stamp, WAL append,
    /// memory-index insertion, quota accounting.
    pub(crate) fn commit_tx(
        &self,
        tx: &mut Transaction,
        durability: Option<Durability>,
    ) -> crate::Result<CommitOutcome> {
        #[allow(clippy::expect_used)]
        let _guard = self.inner.commit_lock.lock().expect("lock is poisoned");

        self.commit_tx_locked(tx, durability)
    }

    fn commit_tx_locked(
        &self,
        tx: &mut Transaction,
        durability: Option<Durability>,
    ) -> crate::Result<CommitOutcome> {
        let lsn = self.inner.lsn.next();

        let (outcome, writes) = self
            .inner
            .txs
            .commit(tx, lsn, |_| PrepareDecision::Proceed);

        if outcome != CommitOutcome::Committed(lsn) {
            return Ok(outcome);
        }

        let bytes = writes
            .iter()
            .map(|(_, record)| record.size() as u64)
            .sum::<u64>();

        // cooperative back-pressure, not an error; a branch task will
        // release bytes
        if !self.inner.quota.acquire(bytes, self.inner.config.quota_timeout) {
            log::warn!("memory quota saturated; proceeding past the wait timeout");
        }

        if let Some(wal) = &self.inner.wal {
            wal.append(&writes, durability)?;
        }

        let databases = self.databases();

        for (db_id, record) in writes {
            let Some(db) = databases.iter().find(|db| db.id == db_id) else {
                continue;
            };

            db.apply(record);
        }

        Ok(CommitOutcome::Committed(lsn))
    }

    pub(crate) fn rollback_tx(&self, tx: &mut Transaction) {
        self.inner.txs.rollback(tx);
    }

    // --- single-statement operations ---

    pub(crate) fn write_single(
        &self,
        db: &Arc<Database>,
        record: Record,
    ) -> crate::Result<Lsn> {
        db.ensure_writable()?;

        // the whole implicit transaction runs under the commit lock, so
        // it can never lose a conflict
        #[allow(clippy::expect_used)]
        let _guard = self.inner.commit_lock.lock().expect("lock is poisoned");

        let mut tx = self
            .inner
            .txs
            .begin(TxKind::ReadWrite, None, self.inner.lsn.get());

        if let Err(e) = self
            .inner
            .txs
            .set(&mut tx, db.id, record.key.user_key.clone(), record)
        {
            self.inner.txs.rollback(&mut tx);
            return Err(e);
        }

        match self.commit_tx_locked(&mut tx, None)? {
            CommitOutcome::Committed(lsn) => Ok(lsn),
            CommitOutcome::Conflict | CommitOutcome::Lock => {
                unreachable!("implicit transactions are serialized by the commit lock")
            }
        }
    }

    /// Non-transactional point read at the given horizon.
    pub(crate) fn get_at(
        &self,
        db: &Arc<Database>,
        key: &[u8],
        vlsn: Lsn,
    ) -> crate::Result<Option<Record>> {
        if db.status() == DbStatus::DropPending {
            return Err(crate::Error::Shutdown);
        }

        let node = db.tree.route(key);

        node.point_get(
            key,
            vlsn,
            &self.inner.page_cache,
            db.upsert_fn().as_ref(),
        )
    }

    // --- maintenance entry points (also driven by the scheduler) ---

    /// Flushes every node's memory index of one database to disk.
    pub(crate) fn flush(&self, db: &Arc<Database>) -> crate::Result<()> {
        for node in db.tree.nodes() {
            crate::scheduler::task::run_branch(self, db, &node)?;
        }

        self.sweep_wal()?;
        Ok(())
    }

    /// Merges every node's branches of one database.
    pub(crate) fn compact(&self, db: &Arc<Database>) -> crate::Result<()> {
        for node in db.tree.nodes() {
            crate::scheduler::task::run_compact(
                self,
                db,
                &node,
                crate::scheduler::task::CompactReason::Count,
            )?;
        }

        crate::scheduler::task::run_nodegc(db)?;
        Ok(())
    }

    /// Captures the current LSN and flushes every node holding older
    /// data (synchronous checkpoint).
    pub fn checkpoint(&self) -> crate::Result<Lsn> {
        let lsn = self.inner.lsn.get();

        for db in self.databases() {
            db.checkpoint_lsn.store(lsn, Ordering::Release);
            crate::scheduler::task::run_checkpoint(self, &db)?;
        }

        self.sweep_wal()?;
        Ok(lsn)
    }

    /// Writes the snapshot fastpath file of one database.
    pub(crate) fn snapshot(&self, db: &Arc<Database>) -> crate::Result<()> {
        crate::scheduler::task::run_snapshot(db)
    }

    /// Runs a full backup, returning the backup sequence number.
    pub fn backup(&self) -> crate::Result<u64> {
        crate::scheduler::task::run_backup(self)
    }

    /// Runs a TTL expiry pass over one database.
    pub(crate) fn expire(&self, db: &Arc<Database>) -> crate::Result<()> {
        crate::scheduler::task::run_expire(self, db)
    }

    /// Deletes WAL segments whose records are durable in branches.
    pub(crate) fn sweep_wal(&self) -> crate::Result<()> {
        let Some(wal) = &self.inner.wal else {
            return Ok(());
        };

        let current = self.inner.lsn.get();

        let durable = self
            .databases()
            .iter()
            .map(|db| db.durable_lsn(current))
            .min()
            .unwrap_or(current);

        let _ = wal.sweep(durable)?;
        Ok(())
    }

    /// Shuts the environment down: stops the workers, drains in-flight
    /// tasks and joins the threads.
    pub fn close(&self) {
        for db in self.databases() {
            if db.status() == DbStatus::Active {
                db.set_status(DbStatus::ShutdownPending);
            }
        }

        self.inner.stop.store(true, Ordering::Release);

        #[allow(clippy::expect_used)]
        let mut workers = self.inner.workers.lock().expect("lock is poisoned");

        for worker in workers.drain(..) {
            let _ = worker.join();
        }

        log::info!("environment at {:?} closed", self.inner.config.path);
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        // workers only hold weak handles; signalling is enough, and this
        // drop may run on a worker thread (never join here)
        self.stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Env {{ path: {:?}, lsn: {} }}",
            self.inner.config.path,
            self.inner.lsn.get(),
        )
    }
}
