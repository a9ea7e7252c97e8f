// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    lsn::LsnCounter,
    mvcc::DbId,
    node::{Node, NodeId},
    schema::Schema,
    tree::Tree,
    upsert::UpsertFn,
    Lsn, Record,
};
use rustc_hash::FxHashMap;
use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
};

/// Lifecycle state of a database
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DbStatus {
    /// Serving reads and writes
    Active,

    /// A background task hit an I/O error or corrupt data; writes are
    /// rejected, cached reads may still succeed
    Malfunction,

    /// Close requested; the next scheduler pass drains in-flight tasks
    ShutdownPending,

    /// Drop requested; files are removed once tasks drain
    DropPending,
}

impl From<u8> for DbStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Malfunction,
            2 => Self::ShutdownPending,
            3 => Self::DropPending,
            _ => Self::Active,
        }
    }
}

/// The planner's three per-database priority queues
///
/// Every node appears in all three; a position update is a remove plus an
/// insert, `O(log n)` each.
#[derive(Default)]
pub(crate) struct PlannerQueues {
    /// Ranked by in-memory size (branch / age rules)
    by_mem: Mutex<BTreeSet<(u64, NodeId)>>,

    /// Ranked by branch count (compact / gc rules)
    by_branches: Mutex<BTreeSet<(u64, NodeId)>>,

    /// Ranked by temperature (lru / anticache rules)
    by_temp: Mutex<BTreeSet<(u64, NodeId)>>,

    positions: Mutex<FxHashMap<NodeId, (u64, u64, u64)>>,
}

impl PlannerQueues {
    /// Re-ranks a node in all three queues.
    pub fn update(&self, node: &Node) {
        let metrics = (
            node.mem_size(),
            node.branch_count() as u64,
            u64::from(node.temperature()),
        );

        #[allow(clippy::expect_used)]
        let mut positions = self.positions.lock().expect("lock is poisoned");
        let old = positions.insert(node.id, metrics);

        #[allow(clippy::expect_used)]
        {
            let mut by_mem = self.by_mem.lock().expect("lock is poisoned");
            if let Some((mem, _, _)) = old {
                by_mem.remove(&(mem, node.id));
            }
            by_mem.insert((metrics.0, node.id));

            let mut by_branches = self.by_branches.lock().expect("lock is poisoned");
            if let Some((_, branches, _)) = old {
                by_branches.remove(&(branches, node.id));
            }
            by_branches.insert((metrics.1, node.id));

            let mut by_temp = self.by_temp.lock().expect("lock is poisoned");
            if let Some((_, _, temp)) = old {
                by_temp.remove(&(temp, node.id));
            }
            by_temp.insert((metrics.2, node.id));
        }
    }

    /// Removes a node from all queues (node replaced or dropped).
    pub fn remove(&self, id: NodeId) {
        #[allow(clippy::expect_used)]
        let mut positions = self.positions.lock().expect("lock is poisoned");

        let Some((mem, branches, temp)) = positions.remove(&id) else {
            return;
        };

        #[allow(clippy::expect_used)]
        {
            self.by_mem.lock().expect("lock is poisoned").remove(&(mem, id));
            self.by_branches
                .lock()
                .expect("lock is poisoned")
                .remove(&(branches, id));
            self.by_temp.lock().expect("lock is poisoned").remove(&(temp, id));
        }
    }

    /// Node with the largest memory index.
    pub fn top_mem(&self) -> Option<(u64, NodeId)> {
        #[allow(clippy::expect_used)]
        self.by_mem
            .lock()
            .expect("lock is poisoned")
            .iter()
            .next_back()
            .copied()
    }

    /// Node with the most branches.
    pub fn top_branches(&self) -> Option<(u64, NodeId)> {
        #[allow(clippy::expect_used)]
        self.by_branches
            .lock()
            .expect("lock is poisoned")
            .iter()
            .next_back()
            .copied()
    }

    /// Hottest node.
    pub fn top_temp(&self) -> Option<(u64, NodeId)> {
        #[allow(clippy::expect_used)]
        self.by_temp
            .lock()
            .expect("lock is poisoned")
            .iter()
            .next_back()
            .copied()
    }

    /// Coldest node.
    pub fn bottom_temp(&self) -> Option<(u64, NodeId)> {
        #[allow(clippy::expect_used)]
        self.by_temp
            .lock()
            .expect("lock is poisoned")
            .iter()
            .next()
            .copied()
    }
}

/// Point-in-time counters of one database
#[derive(Clone, Debug, Default)]
pub struct DatabaseStats {
    pub node_count: usize,
    pub branch_count: usize,

    /// Bytes buffered in memory indices
    pub mem_size: u64,

    /// Stored branch bytes on disk
    pub disk_size: u64,
}

/// One named, schema-typed keyspace of an environment
pub struct Database {
    pub id: DbId,
    pub name: String,
    pub schema: Schema,
    pub path: PathBuf,

    pub(crate) tree: Tree,
    pub(crate) queues: PlannerQueues,

    status: AtomicU8,

    upsert_fn: RwLock<Option<UpsertFn>>,

    pub(crate) next_node_id: LsnCounter,
    pub(crate) next_branch_id: LsnCounter,

    /// Captured LSN of a pending checkpoint (0 = none)
    pub(crate) checkpoint_lsn: AtomicU64,

    /// LRU virtual-LSN horizon
    pub(crate) lru_vlsn: AtomicU64,

    /// Target backup sequence number (0 = no backup pending)
    pub(crate) backup_pending: AtomicU64,

    /// Snapshot requested (explicitly or periodically)
    pub(crate) snapshot_pending: AtomicU64,

    /// Unix seconds of the last expire pass
    pub(crate) last_expire: AtomicU64,

    /// Unix seconds of the last gc pass
    pub(crate) last_gc: AtomicU64,

    /// Unix seconds of the last periodic checkpoint
    pub(crate) last_checkpoint: AtomicU64,
}

impl Database {
    pub(crate) fn new(
        id: DbId,
        name: String,
        schema: Schema,
        path: PathBuf,
        tree: Tree,
    ) -> Arc<Self> {
        let db = Arc::new(Self {
            id,
            name,
            schema,
            path,
            tree,
            queues: PlannerQueues::default(),
            status: AtomicU8::new(0),
            upsert_fn: RwLock::new(None),
            next_node_id: LsnCounter::default(),
            next_branch_id: LsnCounter::default(),
            checkpoint_lsn: AtomicU64::new(0),
            lru_vlsn: AtomicU64::new(0),
            backup_pending: AtomicU64::new(0),
            snapshot_pending: AtomicU64::new(0),
            last_expire: AtomicU64::new(0),
            last_gc: AtomicU64::new(0),
            last_checkpoint: AtomicU64::new(crate::time::unix_timestamp().as_secs()),
        });

        let mut max_node_id = 0;
        let mut max_branch_id = 0;

        for node in db.tree.nodes() {
            max_node_id = max_node_id.max(node.id);

            for branch in node.branches() {
                max_branch_id = max_branch_id.max(branch.id);
            }

            db.queues.update(&node);
        }

        db.next_node_id.fetch_max(max_node_id);
        db.next_branch_id.fetch_max(max_branch_id);

        db
    }

    #[must_use]
    pub fn status(&self) -> DbStatus {
        self.status.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_status(&self, status: DbStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Marks the database as malfunctioning after a background failure.
    pub(crate) fn set_malfunction(&self) {
        log::error!("database {:?} transitioned to malfunction", self.name);
        self.set_status(DbStatus::Malfunction);
    }

    /// Rejects writes unless the database is fully active.
    pub(crate) fn ensure_writable(&self) -> crate::Result<()> {
        match self.status() {
            DbStatus::Active => Ok(()),
            DbStatus::Malfunction => Err(crate::Error::Malfunction),
            DbStatus::ShutdownPending | DbStatus::DropPending => Err(crate::Error::Shutdown),
        }
    }

    /// Registers the merge function folding this database's upserts.
    pub fn register_upsert(&self, upsert_fn: UpsertFn) {
        #[allow(clippy::expect_used)]
        {
            *self.upsert_fn.write().expect("lock is poisoned") = Some(upsert_fn);
        }
    }

    #[must_use]
    pub(crate) fn upsert_fn(&self) -> Option<UpsertFn> {
        #[allow(clippy::expect_used)]
        self.upsert_fn.read().expect("lock is poisoned").clone()
    }

    /// Applies a committed (or replayed) record to the routed node's
    /// memory index; returns the node and the buffered bytes.
    pub(crate) fn apply(&self, record: Record) -> (Arc<Node>, u64) {
        let node = self.tree.route(&record.key.user_key);

        let (added, _) = node.i0().insert(record);

        self.queues.update(&node);

        (node, added)
    }

    /// Oldest LSN still buffered only in memory; everything below is
    /// durable in branches.
    #[must_use]
    pub(crate) fn durable_lsn(&self, current: Lsn) -> Lsn {
        self.tree
            .nodes()
            .iter()
            .filter_map(|node| node.lowest_buffered_lsn())
            .min()
            .map_or(current, |lowest| lowest.saturating_sub(1))
    }

    #[must_use]
    pub fn stats(&self) -> DatabaseStats {
        let nodes = self.tree.nodes();

        DatabaseStats {
            node_count: nodes.len(),
            branch_count: nodes.iter().map(|n| n.branch_count()).sum(),
            mem_size: self.tree.mem_size(),
            disk_size: self.tree.disk_size(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Database {{ id: {}, name: {:?}, status: {:?} }}",
            self.id,
            self.name,
            self.status(),
        )
    }
}
