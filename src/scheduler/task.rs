// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Concrete background task executors
//!
//! Every executor takes the node lock of the node it mutates; a node
//! that is already locked is simply skipped (the planner will come
//! around again).

use crate::{
    branch::writer::{BranchWriter, Options as WriterOptions},
    config::Config,
    db::Database,
    file::{node_gc_file_name, node_incomplete_file_name, node_seal_file_name},
    merge::{BoxedIterator, Merger},
    node::{iter::BranchRangeIter, Node},
    write_stream::{RetentionStream, TtlFilter},
    Env, Record,
};
use std::{
    fs::File,
    ops::Bound,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};

/// Why a compaction was scheduled
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CompactReason {
    /// Branch count exceeded the watermark
    Count,

    /// Obsolete-version ratio exceeded the watermark
    Gc,

    /// TTL expiry pass
    Expire,

    /// LRU horizon advanced past this node's data
    Lru,
}

/// An in-flight backup
pub struct BackupState {
    pub bsn: u64,

    /// `<backup_root>/<bsn>.incomplete`
    pub root: PathBuf,
}

fn writer_options(config: &Config) -> WriterOptions {
    WriterOptions {
        page_size: config.page_size,
        compression: config.compression,
        sparse: config.sparse_pages,
        filter_bpk: config.filter_bpk,
    }
}

struct NodeLockGuard<'a>(&'a Node);

impl Drop for NodeLockGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Seals a node's rotated memory index as a new on-disk branch.
pub(crate) fn run_branch(env: &Env, db: &Arc<Database>, node: &Arc<Node>) -> crate::Result<()> {
    if !node.try_lock() {
        return Ok(());
    }
    let _guard = NodeLockGuard(node);

    // the planner may still hold a node that a compaction replaced
    if db.tree.get_node(node.id).is_none() {
        return Ok(());
    }

    let Some(rotated) = node.rotate() else {
        return Ok(());
    };

    let released = rotated.size();
    let vlsn = env.retention_vlsn();

    // tombstones may only be dropped when nothing older lies beneath
    let is_root = node.branch_count() == 0;

    let stream = RetentionStream::new(rotated.iter().map(Ok), vlsn).evict_tombstones(is_root);

    let branch_id = db.next_branch_id.next();

    let mut writer = BranchWriter::create(
        node.file(),
        node.id,
        branch_id,
        writer_options(&env.inner.config),
    )?;

    for record in stream {
        writer.write(record?)?;
    }

    let branch = writer.finish()?;

    log::debug!(
        "branched node {} of {:?}: {} records, {} bytes released",
        node.id,
        db.name,
        branch.meta.item_count,
        released,
    );

    node.install_branch(Arc::new(branch));

    env.inner.quota.release(released);
    db.queues.update(node);

    env.sweep_wal()?;

    Ok(())
}

/// Merges a node's branches into one or more replacement nodes.
///
/// The merge writer yields one sealed node per pass and resumes for the
/// next whenever its output exceeds the node-size watermark (a node
/// split). A merge producing zero records leaves a single empty node
/// covering the range.
pub(crate) fn run_compact(
    env: &Env,
    db: &Arc<Database>,
    node: &Arc<Node>,
    reason: CompactReason,
) -> crate::Result<()> {
    if !node.try_lock() {
        return Ok(());
    }
    let _guard = NodeLockGuard(node);

    if db.tree.get_node(node.id).is_none() {
        return Ok(());
    }

    let branches = node.branches();

    if branches.is_empty() {
        return Ok(());
    }

    let config = &env.inner.config;
    let folder = db.path.clone();

    let sources = branches
        .iter()
        .map(|branch| {
            Box::new(BranchRangeIter::new(
                node.clone(),
                branch.clone(),
                env.inner.page_cache.clone(),
                Bound::Unbounded,
                Bound::Unbounded,
            )) as BoxedIterator<'static>
        })
        .collect::<Vec<_>>();

    let vlsn = env.retention_vlsn();
    let vlsn_lru = db.lru_vlsn.load(Ordering::Acquire);

    let stream = RetentionStream::new(Merger::new(sources), vlsn)
        .evict_tombstones(true)
        .fold_upserts(db.upsert_fn())
        .vlsn_lru(vlsn_lru);

    let mut stream: Box<dyn Iterator<Item = crate::Result<Record>>> =
        if reason == CompactReason::Expire {
            match config.expire_ttl {
                Some(ttl) => Box::new(
                    stream.with_filter(TtlFilter::new(ttl, crate::time::unix_timestamp_secs())),
                ),
                None => Box::new(stream),
            }
        } else {
            Box::new(stream)
        };

    // One output node per pass of the merge writer
    struct Output {
        id: u64,
        incomplete: PathBuf,
        branch: crate::branch::Branch,
    }

    let mut outputs: Vec<Output> = vec![];
    let mut carry: Option<Record> = None;

    loop {
        let first = match carry.take() {
            Some(record) => record,
            None => match stream.next() {
                Some(record) => record?,
                None => break,
            },
        };

        let new_id = db.next_node_id.next();
        let incomplete = folder.join(node_incomplete_file_name(node.id, new_id));

        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&incomplete)?;

        let mut writer = BranchWriter::create(
            &file,
            new_id,
            db.next_branch_id.next(),
            writer_options(config),
        )?;

        writer.write(first)?;

        for record in stream.by_ref() {
            let record = record?;

            if writer.bytes_written() >= config.node_size {
                // close this output; the record opens the next node
                carry = Some(record);
                break;
            }

            writer.write(record)?;
        }

        let branch = writer.finish()?;

        outputs.push(Output {
            id: new_id,
            incomplete,
            branch,
        });
    }

    // Seal protocol: incomplete -> seal (all), parent -> gc, seal ->
    // final. Recovery resolves any interleaved crash from the file
    // states alone.
    for output in &outputs {
        crate::file::rename_durable(
            &output.incomplete,
            &folder.join(node_seal_file_name(node.id, output.id)),
        )?;
    }

    let gc_path = folder.join(node_gc_file_name(node.id));
    crate::file::rename_durable(&node.path, &gc_path)?;

    let mut new_nodes = vec![];

    for output in outputs {
        let final_path = folder.join(crate::file::node_file_name(output.id));

        crate::file::rename_durable(
            &folder.join(node_seal_file_name(node.id, output.id)),
            &final_path,
        )?;

        let routing_key = output
            .branch
            .min_key()
            .cloned()
            .unwrap_or_else(crate::Slice::empty);

        new_nodes.push(Node::open_with_branches(
            &final_path,
            output.id,
            routing_key,
            vec![Arc::new(output.branch)],
        )?);
    }

    if new_nodes.is_empty() {
        // everything was garbage; the range stays covered by a single
        // empty node
        let new_id = db.next_node_id.next();
        new_nodes.push(Node::create(&folder, new_id, node.routing_key.clone())?);
    }

    log::debug!(
        "compacted node {} of {:?} ({reason:?}) into {} node(s)",
        node.id,
        db.name,
        new_nodes.len(),
    );

    // The swap runs under the commit lock so no writer can slip records
    // into the old memory indices mid-migration
    {
        #[allow(clippy::expect_used)]
        let _commit = env.inner.commit_lock.lock().expect("lock is poisoned");

        db.tree.replace(node, new_nodes.clone());
        db.queues.remove(node.id);

        let mut buffered: Vec<Record> = node.i0().iter().collect();
        if let Some(i1) = node.i1() {
            buffered.extend(i1.iter());
        }

        for record in buffered {
            let target = db.tree.route(&record.key.user_key);
            target.i0().insert(record);
        }

        for new_node in &new_nodes {
            db.queues.update(new_node);
        }
    }

    Ok(())
}

/// Flushes every node that still buffers data older than the captured
/// checkpoint LSN, then clears the checkpoint.
pub(crate) fn run_checkpoint(env: &Env, db: &Arc<Database>) -> crate::Result<()> {
    let lsn = db.checkpoint_lsn.load(Ordering::Acquire);

    if lsn == 0 {
        return Ok(());
    }

    for node in db.tree.nodes() {
        if node.lowest_buffered_lsn().is_some_and(|lowest| lowest <= lsn) {
            run_branch(env, db, &node)?;
        }
    }

    let done = db
        .tree
        .nodes()
        .iter()
        .all(|node| node.lowest_buffered_lsn().is_none_or(|lowest| lowest > lsn));

    if done {
        db.checkpoint_lsn.store(0, Ordering::Release);
        env.sweep_wal()?;

        log::debug!("checkpoint of {:?} complete at lsn {lsn}", db.name);
    }

    Ok(())
}

/// TTL expiry pass: flush memory indices holding expired records, then
/// rewrite nodes whose branches hold expired records.
pub(crate) fn run_expire(env: &Env, db: &Arc<Database>) -> crate::Result<()> {
    let Some(ttl) = env.inner.config.expire_ttl else {
        return Ok(());
    };

    let now = crate::time::unix_timestamp_secs();
    let expired = |timestamp: u32| now.saturating_sub(timestamp) >= ttl;

    for node in db.tree.nodes() {
        let mem_expired = node
            .i0()
            .lowest_timestamp()
            .or_else(|| node.i1().and_then(|i1| i1.lowest_timestamp()))
            .is_some_and(expired);

        if mem_expired {
            run_branch(env, db, &node)?;
        }
    }

    for node in db.tree.nodes() {
        let branch_expired = node
            .branches()
            .iter()
            .any(|branch| branch.meta.item_count > 0 && expired(branch.meta.min_timestamp));

        if branch_expired {
            run_compact(env, db, &node, CompactReason::Expire)?;
        }
    }

    Ok(())
}

/// Writes the database's snapshot fastpath file.
pub(crate) fn run_snapshot(db: &Arc<Database>) -> crate::Result<()> {
    crate::snapshot_file::write_snapshot(&db.path, &db.tree.nodes())
}

/// Deletes the files of replaced nodes whose last reader dropped.
pub(crate) fn run_nodegc(db: &Arc<Database>) -> crate::Result<()> {
    for node in db.tree.reap_graveyard() {
        let gc_path = db.path.join(node_gc_file_name(node.id));

        let target = if gc_path.exists() { gc_path } else { node.path.clone() };

        match std::fs::remove_file(&target) {
            Ok(()) => log::debug!("nodegc: removed {target:?}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        db.queues.remove(node.id);
    }

    Ok(())
}

/// Advances the LRU discard horizon and rewrites the node with the
/// oldest data.
pub(crate) fn run_lru(env: &Env, db: &Arc<Database>) -> crate::Result<()> {
    let step = env.inner.config.lru_step;
    let ceiling = env.retention_vlsn();

    let horizon = (db.lru_vlsn.load(Ordering::Acquire) + step).min(ceiling);
    db.lru_vlsn.store(horizon, Ordering::Release);

    let oldest = db
        .tree
        .nodes()
        .into_iter()
        .filter(|node| node.branch_count() > 0)
        .min_by_key(|node| {
            node.branches()
                .iter()
                .map(|branch| branch.meta.min_lsn)
                .min()
                .unwrap_or(u64::MAX)
        });

    if let Some(node) = oldest {
        let below = node
            .branches()
            .iter()
            .any(|branch| branch.meta.item_count > 0 && branch.meta.min_lsn < horizon);

        if below {
            run_compact(env, db, &node, CompactReason::Lru)?;
        }
    }

    Ok(())
}

/// Promotes a node's file into RAM or revokes it (anticache).
pub(crate) fn run_anticache(node: &Arc<Node>, promote: bool) -> crate::Result<()> {
    if promote {
        node.promote_resident()?;
    } else {
        node.drop_resident();
        node.cool();
    }

    Ok(())
}

/// Removes a dropped database's files once its tasks drained.
pub(crate) fn run_drop(env: &Env, db: &Arc<Database>) -> crate::Result<()> {
    {
        #[allow(clippy::expect_used)]
        let mut databases = env.inner.databases.write().expect("lock is poisoned");
        databases.retain(|other| other.id != db.id);
    }

    std::fs::remove_dir_all(&db.path)?;

    log::info!("dropped database {:?}", db.name);

    Ok(())
}

// --- backup ---

/// Bumps the backup id and opens the `<bsn>.incomplete` staging
/// directory.
pub(crate) fn request_backup(env: &Env) -> crate::Result<u64> {
    let Some(backup_root) = env.inner.config.backup_path.clone() else {
        return Err(crate::Error::BadRequest("no backup path configured"));
    };

    #[allow(clippy::expect_used)]
    let mut state = env.inner.backup_state.lock().expect("lock is poisoned");

    if state.is_some() {
        return Err(crate::Error::BadRequest("a backup is already running"));
    }

    let bsn = env.inner.backup_seq.next();
    let root = backup_root.join(format!("{bsn}.incomplete"));

    std::fs::create_dir_all(&root)?;

    *state = Some(BackupState { bsn, root });

    Ok(bsn)
}

/// Next node of this database still missing from the active backup.
pub(crate) fn next_backup_node(env: &Env, db: &Arc<Database>) -> Option<Arc<Node>> {
    let bsn = {
        #[allow(clippy::expect_used)]
        let state = env.inner.backup_state.lock().expect("lock is poisoned");
        state.as_ref()?.bsn
    };

    db.tree
        .nodes()
        .into_iter()
        .find(|node| node.last_backup.load(Ordering::Acquire) < bsn)
}

/// Copies one node file (plus the schema file) into the backup staging
/// directory.
pub(crate) fn run_backup_node(
    env: &Env,
    db: &Arc<Database>,
    node: &Arc<Node>,
) -> crate::Result<()> {
    let (bsn, root) = {
        #[allow(clippy::expect_used)]
        let state = env.inner.backup_state.lock().expect("lock is poisoned");

        match state.as_ref() {
            Some(state) => (state.bsn, state.root.clone()),
            None => return Ok(()),
        }
    };

    let db_dir = root.join(&db.name);
    std::fs::create_dir_all(&db_dir)?;

    let scheme_src = db.path.join(crate::file::SCHEME_FILE);
    let scheme_dst = db_dir.join(crate::file::SCHEME_FILE);

    if !scheme_dst.exists() {
        std::fs::copy(&scheme_src, &scheme_dst)?;
    }

    // a torn tail (a branch sealed mid-copy) is truncated by the branch
    // walk when the backup is opened
    std::fs::copy(&node.path, db_dir.join(crate::file::node_file_name(node.id)))?;

    node.last_backup.store(bsn, Ordering::Release);

    log::debug!("backed up node {} of {:?} (bsn {bsn})", node.id, db.name);

    Ok(())
}

/// Whether every database has every node at the active backup id.
pub(crate) fn backup_ready_to_finish(env: &Env) -> bool {
    let bsn = {
        #[allow(clippy::expect_used)]
        let state = env.inner.backup_state.lock().expect("lock is poisoned");

        match state.as_ref() {
            Some(state) => state.bsn,
            None => return false,
        }
    };

    env.databases().iter().all(|db| {
        db.tree
            .nodes()
            .iter()
            .all(|node| node.last_backup.load(Ordering::Acquire) >= bsn)
    })
}

/// Rotates the WAL, copies its segments, and atomically completes the
/// backup directory.
pub(crate) fn run_backup_finish(env: &Env) -> crate::Result<()> {
    let Some(state) = ({
        #[allow(clippy::expect_used)]
        env.inner.backup_state.lock().expect("lock is poisoned").take()
    }) else {
        return Ok(());
    };

    if let Some(wal) = &env.inner.wal {
        wal.rotate()?;

        let log_dir = state.root.join(crate::file::LOG_FOLDER);
        std::fs::create_dir_all(&log_dir)?;

        for path in wal.segment_paths() {
            #[allow(clippy::expect_used)]
            let name = path.file_name().expect("segment paths have file names");
            std::fs::copy(&path, log_dir.join(name))?;
        }
    }

    #[allow(clippy::expect_used)]
    let backup_root = state
        .root
        .parent()
        .expect("staging dir has a parent")
        .to_path_buf();

    let final_dir = backup_root.join(state.bsn.to_string());
    crate::file::rename_durable(&state.root, &final_dir)?;

    log::info!("backup {} complete at {final_dir:?}", state.bsn);

    Ok(())
}

/// Runs a complete backup synchronously.
pub(crate) fn run_backup(env: &Env) -> crate::Result<u64> {
    let bsn = request_backup(env)?;

    for db in env.databases() {
        while let Some(node) = next_backup_node(env, &db) {
            run_backup_node(env, &db, &node)?;
        }
    }

    run_backup_finish(env)?;

    Ok(bsn)
}
