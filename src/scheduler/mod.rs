// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The background planner and worker pool
//!
//! Each worker loops cooperatively: pick the next task through the
//! planner, execute it (which may take a while), repeat. The planner
//! round-robins over databases and selects by rule priority; the current
//! memory-usage zone (deciles of the quota) scales the branch watermark
//! so that pressure drains the write buffers faster.
//!
//! At most one task at a time targets any node (the node lock); tasks run
//! to completion, there is no mid-task cancellation. A failing task
//! transitions its database to malfunction and the scheduler moves on to
//! the other databases.

pub mod task;

use crate::{
    config::CompactMode,
    db::{Database, DbStatus},
    node::Node,
    Env,
};
use std::sync::{atomic::Ordering, Arc};
use task::CompactReason;

/// A unit of background work selected by the planner
pub(crate) enum Task {
    Branch { db: Arc<Database>, node: Arc<Node> },
    Compact {
        db: Arc<Database>,
        node: Arc<Node>,
        reason: CompactReason,
    },
    Checkpoint { db: Arc<Database> },
    Expire { db: Arc<Database> },
    Snapshot { db: Arc<Database> },
    BackupNode { db: Arc<Database>, node: Arc<Node> },
    BackupFinish,
    NodeGc { db: Arc<Database> },
    Lru { db: Arc<Database> },
    Anticache {
        db: Arc<Database>,
        node: Arc<Node>,
        promote: bool,
    },
    Drop { db: Arc<Database> },
}

/// Branch watermark scaled by the memory-pressure zone.
fn zone_branch_watermark(base: u64, zone: u8) -> u64 {
    let scaled = match zone {
        0..=50 => base,
        60 | 70 => base / 2,
        80 => base / 4,
        _ => base / 8,
    };

    scaled.max(1)
}

/// Picks the next task, or `None` when every database is idle.
pub(crate) fn plan_next(env: &Env) -> Option<Task> {
    let databases = env.databases();

    if databases.is_empty() {
        return None;
    }

    let zone = env.inner.quota.zone();
    let start = env.inner.rr.fetch_add(1, Ordering::Relaxed) % databases.len();

    for offset in 0..databases.len() {
        #[allow(clippy::indexing_slicing)]
        let db = &databases[(start + offset) % databases.len()];

        if let Some(task) = plan_database(env, db, zone) {
            return Some(task);
        }
    }

    // env-wide: finalize a backup once every database is done
    if task::backup_ready_to_finish(env) {
        return Some(Task::BackupFinish);
    }

    None
}

#[allow(clippy::too_many_lines)]
fn plan_database(env: &Env, db: &Arc<Database>, zone: u8) -> Option<Task> {
    let config = &env.inner.config;

    match db.status() {
        DbStatus::DropPending => return Some(Task::Drop { db: db.clone() }),
        DbStatus::ShutdownPending | DbStatus::Malfunction => return None,
        DbStatus::Active => {}
    }

    // nodegc: replaced nodes whose refcount drained
    if db.tree.graveyard_reapable() {
        return Some(Task::NodeGc { db: db.clone() });
    }

    // checkpoint: flush every node holding data older than the captured
    // LSN
    if db.checkpoint_lsn.load(Ordering::Acquire) > 0 {
        return Some(Task::Checkpoint { db: db.clone() });
    }

    // periodic checkpoint capture
    if let Some(period) = config.checkpoint_period {
        let now = crate::time::unix_timestamp().as_secs();

        if now.saturating_sub(db.last_checkpoint.load(Ordering::Acquire)) >= period.as_secs() {
            db.last_checkpoint.store(now, Ordering::Release);
            db.checkpoint_lsn
                .store(env.inner.lsn.get().max(1), Ordering::Release);

            return Some(Task::Checkpoint { db: db.clone() });
        }
    }

    // backup: copy nodes not yet at the active backup id
    if let Some(node) = task::next_backup_node(env, db) {
        return Some(Task::BackupNode {
            db: db.clone(),
            node,
        });
    }

    // branch: a node's memory index exceeds the (zone-scaled) watermark
    let watermark = zone_branch_watermark(config.branch_watermark, zone);

    if let Some((_, node_id)) = db.queues.top_mem() {
        if let Some(node) = db.tree.get_node(node_id) {
            if node.mem_size() >= watermark && node.i1().is_none() {
                return Some(Task::Branch {
                    db: db.clone(),
                    node,
                });
            }
        }
    }

    // age: an idle but non-trivial memory index is flushed eventually
    for node in db.tree.nodes() {
        let i0 = node.i0();

        if !i0.is_empty()
            && i0.idle_secs() >= config.age_period.as_secs()
            && i0.size() >= config.age_watermark
            && node.i1().is_none()
        {
            return Some(Task::Branch {
                db: db.clone(),
                node,
            });
        }
    }

    let now = crate::time::unix_timestamp().as_secs();

    // expire: periodic TTL pass
    if config.expire_ttl.is_some()
        && now.saturating_sub(db.last_expire.load(Ordering::Acquire))
            >= config.expire_period.as_secs()
    {
        db.last_expire.store(now, Ordering::Release);
        return Some(Task::Expire { db: db.clone() });
    }

    // compact: too many branches on some node
    if config.compact_mode != CompactMode::CheckpointOnly {
        if let Some((count, node_id)) = db.queues.top_branches() {
            if count as usize > config.compact_watermark {
                if let Some(node) = db.tree.get_node(node_id) {
                    return Some(Task::Compact {
                        db: db.clone(),
                        node,
                        reason: CompactReason::Count,
                    });
                }
            }
        }
    }

    // gc: periodic dup-ratio pass
    if now.saturating_sub(db.last_gc.load(Ordering::Acquire)) >= config.gc_period.as_secs() {
        db.last_gc.store(now, Ordering::Release);

        let horizon = env.retention_vlsn();

        for node in db.tree.nodes() {
            let garbage = node.branches().iter().any(|branch| {
                branch.meta.dup_ratio() >= config.gc_dup_ratio
                    && branch.meta.min_dup_lsn <= horizon
            });

            if garbage {
                return Some(Task::Compact {
                    db: db.clone(),
                    node,
                    reason: CompactReason::Gc,
                });
            }
        }
    }

    // lru: advance the discard horizon under memory pressure, as long
    // as some branch still holds data the next step would cover
    if config.lru_step > 0 && zone >= 80 {
        let horizon = db.lru_vlsn.load(Ordering::Acquire);

        let behind = db.tree.nodes().iter().any(|node| {
            node.branches().iter().any(|branch| {
                branch.meta.item_count > 0
                    && branch.meta.min_lsn < horizon + config.lru_step
            })
        });

        if behind {
            return Some(Task::Lru { db: db.clone() });
        }
    }

    // snapshot: explicitly requested
    if db.snapshot_pending.swap(0, Ordering::AcqRel) > 0 {
        return Some(Task::Snapshot { db: db.clone() });
    }

    // anticache: promote hot nodes, revoke cold ones
    if let Some((temp, node_id)) = db.queues.top_temp() {
        if temp >= u64::from(config.anticache_hot) {
            if let Some(node) = db.tree.get_node(node_id) {
                if !node.is_resident() && node.disk_size() > 0 {
                    return Some(Task::Anticache {
                        db: db.clone(),
                        node,
                        promote: true,
                    });
                }
            }
        }
    }

    if let Some((temp, node_id)) = db.queues.bottom_temp() {
        if temp <= u64::from(config.anticache_cold) {
            if let Some(node) = db.tree.get_node(node_id) {
                if node.is_resident() {
                    return Some(Task::Anticache {
                        db: db.clone(),
                        node,
                        promote: false,
                    });
                }
            }
        }
    }

    None
}

/// Executes one task, transitioning the database to malfunction on
/// failure.
pub(crate) fn execute(env: &Env, task: &Task) {
    let result = match task {
        Task::Branch { db, node } => task::run_branch(env, db, node),
        Task::Compact { db, node, reason } => task::run_compact(env, db, node, *reason),
        Task::Checkpoint { db } => task::run_checkpoint(env, db),
        Task::Expire { db } => task::run_expire(env, db),
        Task::Snapshot { db } => task::run_snapshot(db),
        Task::BackupNode { db, node } => task::run_backup_node(env, db, node),
        Task::BackupFinish => task::run_backup_finish(env),
        Task::NodeGc { db } => task::run_nodegc(db),
        Task::Lru { db } => task::run_lru(env, db),
        Task::Anticache { node, promote, .. } => task::run_anticache(node, *promote),
        Task::Drop { db } => task::run_drop(env, db),
    };

    if let Err(e) = result {
        let db = match task {
            Task::Branch { db, .. }
            | Task::Compact { db, .. }
            | Task::Checkpoint { db }
            | Task::Expire { db }
            | Task::Snapshot { db }
            | Task::BackupNode { db, .. }
            | Task::NodeGc { db }
            | Task::Lru { db }
            | Task::Anticache { db, .. }
            | Task::Drop { db } => Some(db),
            Task::BackupFinish => None,
        };

        if let Some(db) = db {
            log::error!("background task failed on database {:?}: {e}", db.name);
            db.set_malfunction();
        } else {
            log::error!("background task failed: {e}");
        }
    }
}

/// Starts the worker pool.
///
/// Workers hold a weak handle only, so dropping the last user handle
/// shuts the environment down instead of leaking a reference cycle.
pub(crate) fn spawn_workers(env: &Env, count: usize) {
    #[allow(clippy::expect_used)]
    let mut workers = env.inner.workers.lock().expect("lock is poisoned");

    for idx in 0..count {
        let weak = std::sync::Arc::downgrade(&env.inner);

        let handle = std::thread::Builder::new()
            .name(format!("tundra-worker-{idx}"))
            .spawn(move || worker_loop(&weak));

        match handle {
            Ok(handle) => workers.push(handle),
            Err(e) => log::error!("could not spawn worker {idx}: {e}"),
        }
    }
}

fn worker_loop(inner: &std::sync::Weak<crate::env::EnvInner>) {
    log::debug!("worker started");

    loop {
        let Some(strong) = inner.upgrade() else {
            break;
        };

        let env = Env { inner: strong };

        if env.inner.stop.load(Ordering::Acquire) {
            break;
        }

        match plan_next(&env) {
            Some(task) => execute(&env, &task),
            None => {
                let tick = env.inner.config.idle_tick;
                drop(env);
                std::thread::sleep(tick);
            }
        }
    }

    log::debug!("worker stopped");
}
