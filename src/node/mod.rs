// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod iter;

use crate::{
    branch::{Branch, BranchTrailer, Seal, SEAL_SIZE},
    coding::Decode,
    file::read_exact_at,
    memindex::MemIndex,
    page::Page,
    upsert::UpsertFn,
    Checksum, Lsn, Record, Slice, UserKey, ValueKind,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

/// Node identifier, unique within a database
pub type NodeId = u64;

/// Shared cache of decoded pages, keyed by `(node id, file offset)`
pub type PageCache = quick_cache::sync::Cache<(NodeId, u64), Page>;

/// The LSM unit of routing: one file, one memory index, a chain of
/// branches, a key range
///
/// `i1` exists only while a branching task is in flight for this node.
/// The lock flag serializes tasks targeting the node; readers instead
/// hold an `Arc` so a concurrent compaction cannot unlink the underlying
/// file while pages are still being read.
pub struct Node {
    pub id: NodeId,

    /// Smallest key this node is responsible for; the bootstrap node
    /// carries the empty key
    pub routing_key: UserKey,

    pub path: PathBuf,
    file: File,

    /// Active memory index
    i0: RwLock<Arc<MemIndex>>,

    /// Rotated memory index, present only while a branch task runs
    i1: RwLock<Option<Arc<MemIndex>>>,

    /// On-disk branches, newest first; the last one is the node's root
    branches: RwLock<Vec<Arc<Branch>>>,

    /// Whole-file bytes when the anticache policy promoted this node into
    /// RAM
    resident: RwLock<Option<Slice>>,

    /// 0..=100 heat score, bumped by reads, decayed by the planner
    temperature: AtomicU32,

    /// Task lock; at most one background task may target a node
    locked: AtomicBool,

    /// Backup sequence number this node was last copied at
    pub last_backup: AtomicU64,
}

impl Node {
    /// Creates a fresh node with an empty file.
    pub fn create(folder: &Path, id: NodeId, routing_key: UserKey) -> crate::Result<Arc<Self>> {
        let path = folder.join(crate::file::node_file_name(id));

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.sync_all()?;
        crate::file::fsync_directory(folder)?;

        Ok(Arc::new(Self {
            id,
            routing_key,
            path,
            file,
            i0: RwLock::new(Arc::new(MemIndex::default())),
            i1: RwLock::new(None),
            branches: RwLock::new(vec![]),
            resident: RwLock::new(None),
            temperature: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            last_backup: AtomicU64::new(0),
        }))
    }

    /// Opens an existing node file and walks its branch chain.
    ///
    /// Branches are walked `seal → trailer → seal`; an open seal without
    /// a valid close seal marks an interrupted append, and the file is
    /// truncated back to the last durable branch.
    pub fn open(path: &Path, id: NodeId, routing_key: UserKey) -> crate::Result<Arc<Self>> {
        let file = File::options().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        let mut branches: Vec<Arc<Branch>> = vec![];
        let mut offset = 0u64;

        while offset + SEAL_SIZE as u64 <= file_size {
            match Self::read_branch(&file, offset, file_size, id) {
                Ok((branch, next_offset)) => {
                    // newest first
                    branches.insert(0, Arc::new(branch));
                    offset = next_offset;
                }
                Err(e) => {
                    log::warn!(
                        "node {id}: discarding unsealed tail at offset {offset} ({e}), truncating",
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        log::debug!("opened node {id} with {} branches", branches.len());

        Ok(Arc::new(Self {
            id,
            routing_key,
            path: path.to_path_buf(),
            file,
            i0: RwLock::new(Arc::new(MemIndex::default())),
            i1: RwLock::new(None),
            branches: RwLock::new(branches),
            resident: RwLock::new(None),
            temperature: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            last_backup: AtomicU64::new(0),
        }))
    }

    fn read_branch(
        file: &File,
        offset: u64,
        file_size: u64,
        node_id: NodeId,
    ) -> crate::Result<(Branch, u64)> {
        let seal_bytes = read_exact_at(file, offset, SEAL_SIZE)?;
        let open_seal = Seal::decode_from(&mut &seal_bytes[..])?;

        if open_seal.closed || open_seal.node_id != node_id || open_seal.trailer_offset == 0 {
            return Err(crate::Error::Unrecoverable);
        }

        let trailer_end = open_seal.trailer_offset + u64::from(open_seal.trailer_size);

        if trailer_end + SEAL_SIZE as u64 > file_size {
            return Err(crate::Error::Unrecoverable);
        }

        let trailer_bytes = read_exact_at(
            file,
            open_seal.trailer_offset,
            open_seal.trailer_size as usize,
        )?;

        Checksum::of(&trailer_bytes).check(open_seal.trailer_checksum)?;

        let close_bytes = read_exact_at(file, trailer_end, SEAL_SIZE)?;
        let close_seal = Seal::decode_from(&mut &close_bytes[..])?;

        if !close_seal.closed || close_seal.branch_id != open_seal.branch_id {
            return Err(crate::Error::Unrecoverable);
        }

        let trailer = BranchTrailer::decode_from(&mut &trailer_bytes[..])?;
        let branch = Branch::from_trailer(open_seal.branch_id, offset, trailer)?;

        Ok((branch, trailer_end + SEAL_SIZE as u64))
    }

    /// Opens a node file with an already-known branch chain (snapshot
    /// fastpath), skipping the tail scan.
    pub fn open_with_branches(
        path: &Path,
        id: NodeId,
        routing_key: UserKey,
        branches: Vec<Arc<Branch>>,
    ) -> crate::Result<Arc<Self>> {
        let file = File::options().read(true).write(true).open(path)?;

        Ok(Arc::new(Self {
            id,
            routing_key,
            path: path.to_path_buf(),
            file,
            i0: RwLock::new(Arc::new(MemIndex::default())),
            i1: RwLock::new(None),
            branches: RwLock::new(branches),
            resident: RwLock::new(None),
            temperature: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            last_backup: AtomicU64::new(0),
        }))
    }

    /// The node file, for branch writers.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Active memory index.
    #[must_use]
    pub fn i0(&self) -> Arc<MemIndex> {
        #[allow(clippy::expect_used)]
        self.i0.read().expect("lock is poisoned").clone()
    }

    /// Rotated memory index, if a branch task is in flight.
    #[must_use]
    pub fn i1(&self) -> Option<Arc<MemIndex>> {
        #[allow(clippy::expect_used)]
        self.i1.read().expect("lock is poisoned").clone()
    }

    /// Branch chain, newest first.
    #[must_use]
    pub fn branches(&self) -> Vec<Arc<Branch>> {
        #[allow(clippy::expect_used)]
        self.branches.read().expect("lock is poisoned").clone()
    }

    #[must_use]
    pub fn branch_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.branches.read().expect("lock is poisoned").len()
    }

    /// Moves `i0` aside as `i1` and installs a fresh `i0`.
    ///
    /// Returns the rotated index, or `None` if a rotation is already in
    /// flight or there is nothing to rotate.
    pub fn rotate(&self) -> Option<Arc<MemIndex>> {
        #[allow(clippy::expect_used)]
        let mut i1 = self.i1.write().expect("lock is poisoned");

        if i1.is_some() {
            return None;
        }

        #[allow(clippy::expect_used)]
        let mut i0 = self.i0.write().expect("lock is poisoned");

        if i0.is_empty() {
            return None;
        }

        i0.flag_rotated();

        let rotated = std::mem::take(&mut *i0);
        *i1 = Some(rotated.clone());

        Some(rotated)
    }

    /// Attaches a freshly sealed branch and drops the rotated index it
    /// was built from.
    pub fn install_branch(&self, branch: Arc<Branch>) {
        #[allow(clippy::expect_used)]
        {
            self.branches
                .write()
                .expect("lock is poisoned")
                .insert(0, branch);

            *self.i1.write().expect("lock is poisoned") = None;
        }

        // promoted bytes are stale once the file grew
        self.drop_resident();
    }

    /// Tries to take the task lock.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the task lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Heat score (0..=100).
    #[must_use]
    pub fn temperature(&self) -> u32 {
        self.temperature.load(Ordering::Relaxed)
    }

    pub fn warm(&self) {
        let _ = self
            .temperature
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                (t < 100).then_some(t + 1)
            });
    }

    pub fn cool(&self) {
        let _ = self
            .temperature
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                (t > 0).then_some(t / 2)
            });
    }

    /// Bytes buffered in memory (`i0` plus `i1`).
    #[must_use]
    pub fn mem_size(&self) -> u64 {
        self.i0().size() + self.i1().map_or(0, |i| i.size())
    }

    /// Stored bytes of all branches (pages plus trailers).
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.branches()
            .iter()
            .map(|b| b.meta.byte_size)
            .sum::<u64>()
    }

    /// Lowest LSN buffered in memory, driving checkpoints and WAL gc.
    #[must_use]
    pub fn lowest_buffered_lsn(&self) -> Option<Lsn> {
        let i0 = self.i0().lowest_lsn();
        let i1 = self.i1().and_then(|i| i.lowest_lsn());

        match (i0, i1) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Promotes the whole node file into RAM (anticache).
    pub fn promote_resident(&self) -> crate::Result<()> {
        let size = self.file.metadata()?.len() as usize;
        let bytes = read_exact_at(&self.file, 0, size)?;

        #[allow(clippy::expect_used)]
        {
            *self.resident.write().expect("lock is poisoned") = Some(bytes);
        }

        log::debug!("node {}: promoted {size} bytes into RAM", self.id);
        Ok(())
    }

    /// Revokes the promoted bytes (anticache eviction).
    pub fn drop_resident(&self) {
        #[allow(clippy::expect_used)]
        {
            *self.resident.write().expect("lock is poisoned") = None;
        }
    }

    /// Whether the node's file is promoted into RAM.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.resident.read().expect("lock is poisoned").is_some()
    }

    /// Loads one page of a branch, consulting the promoted bytes and the
    /// shared page cache before falling back to `pread`.
    pub fn read_page(
        &self,
        branch: &Branch,
        page_idx: usize,
        cache: &PageCache,
    ) -> crate::Result<Page> {
        let descriptor = branch
            .pages
            .get(page_idx)
            .ok_or(crate::Error::Unrecoverable)?;

        let cache_key = (self.id, descriptor.file_offset);

        if let Some(page) = cache.get(&cache_key) {
            return Ok(page);
        }

        let resident = {
            #[allow(clippy::expect_used)]
            self.resident.read().expect("lock is poisoned").clone()
        };

        let bytes = match resident {
            Some(all) => {
                let start = descriptor.file_offset as usize;
                let end = start + descriptor.stored_size as usize;

                if end > all.len() {
                    return Err(crate::Error::Unrecoverable);
                }

                all.slice(start..end)
            }
            None => read_exact_at(
                &self.file,
                descriptor.file_offset,
                descriptor.stored_size as usize,
            )?,
        };

        let page = Page::decode_from_bytes(&bytes)?;
        cache.insert(cache_key, page.clone());

        Ok(page)
    }

    /// Point read: walks `i0`, `i1`, then every branch newest-first, and
    /// folds pending upserts.
    ///
    /// Returns `None` for absent keys and for keys whose newest visible
    /// version is a tombstone.
    pub fn point_get(
        &self,
        key: &[u8],
        vlsn: Lsn,
        cache: &PageCache,
        upsert_fn: Option<&UpsertFn>,
    ) -> crate::Result<Option<Record>> {
        self.warm();

        let mut chain: Vec<Record> = vec![];

        'sources: {
            if Self::extend_chain(&mut chain, self.i0().get_chain(key, vlsn)) {
                break 'sources;
            }

            if let Some(i1) = self.i1() {
                if Self::extend_chain(&mut chain, i1.get_chain(key, vlsn)) {
                    break 'sources;
                }
            }

            for branch in self.branches() {
                if branch.meta.min_lsn > vlsn {
                    continue;
                }

                if !branch.maybe_contains(key) {
                    continue;
                }

                let Some(page_idx) = branch.find_page(key) else {
                    continue;
                };

                let page = self.read_page(&branch, page_idx, cache)?;

                let mut fragment = vec![];
                let start = page.lower_bound(key, vlsn);

                let mut scan = Self::scan_chain(&page, start, key, &mut fragment);

                // page size is a byte watermark; a version chain can run
                // across any number of page boundaries
                let mut next_idx = page_idx + 1;

                while scan == ChainScan::PageExhausted && next_idx < branch.pages.len() {
                    let next = self.read_page(&branch, next_idx, cache)?;
                    scan = Self::scan_chain(&next, 0, key, &mut fragment);
                    next_idx += 1;
                }

                if Self::extend_chain(&mut chain, fragment) {
                    break 'sources;
                }
            }
        }

        if chain.is_empty() {
            return Ok(None);
        }

        Ok(crate::upsert::fold(upsert_fn, &chain).filter(|r| !r.is_tombstone()))
    }

    /// Collects `key`'s versions from `start` onwards into `fragment`.
    fn scan_chain(page: &Page, start: usize, key: &[u8], fragment: &mut Vec<Record>) -> ChainScan {
        for idx in start..page.len() {
            if page.key_at(idx) != key {
                return ChainScan::KeyEnded;
            }

            let record = page.get(idx);
            let is_upsert = record.key.kind == ValueKind::Upsert;
            fragment.push(record);

            if !is_upsert {
                return ChainScan::BaseFound;
            }
        }

        ChainScan::PageExhausted
    }

    /// Appends a chain fragment; returns `true` once a non-upsert base
    /// was reached.
    fn extend_chain(chain: &mut Vec<Record>, fragment: Vec<Record>) -> bool {
        if chain.last().is_some_and(|r| !r.is_upsert()) {
            return true;
        }

        for record in fragment {
            let done = !record.is_upsert();
            chain.push(record);

            if done {
                return true;
            }
        }

        false
    }
}

/// How a page scan for one key's version chain ended
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ChainScan {
    /// A non-upsert base closed the chain
    BaseFound,

    /// A different key followed; the chain ends in this branch
    KeyEnded,

    /// The page ran out mid-chain; continue on the next page
    PageExhausted,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Node {{ id: {}, branches: {}, mem: {}B }}",
            self.id,
            self.branch_count(),
            self.mem_size(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::branch::writer::{BranchWriter, Options};
    use test_log::test;

    fn cache() -> PageCache {
        PageCache::new(64)
    }

    fn v(key: &str, value: &str, lsn: u64) -> Record {
        Record::from_components(key.as_bytes(), value.as_bytes(), lsn, ValueKind::Value)
    }

    #[test]
    fn node_create_is_empty() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        assert_eq!(0, node.branch_count());
        assert!(node.i0().is_empty());
        assert!(node.i1().is_none());

        Ok(())
    }

    #[test]
    fn node_branch_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        {
            let mut writer = BranchWriter::create(node.file(), 1, 1, Options::default())?;
            for record in [v("a", "1", 1), v("b", "2", 2), v("c", "3", 3)] {
                writer.write(record)?;
            }
            let branch = writer.finish()?;
            node.install_branch(Arc::new(branch));
        }

        let cache = cache();
        let got = node.point_get(b"b", u64::MAX, &cache, None)?;
        assert_eq!(b"2", &*got.unwrap().value);

        // reopen from disk
        let reopened = Node::open(&node.path, 1, Slice::empty())?;
        assert_eq!(1, reopened.branch_count());

        let got = reopened.point_get(b"b", u64::MAX, &cache, None)?;
        assert_eq!(b"2", &*got.unwrap().value);

        assert!(reopened.point_get(b"x", u64::MAX, &cache, None)?.is_none());

        Ok(())
    }

    #[test]
    fn node_truncates_torn_branch() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        {
            let mut writer = BranchWriter::create(node.file(), 1, 1, Options::default())?;
            writer.write(v("a", "1", 1))?;
            let branch = writer.finish()?;
            node.install_branch(Arc::new(branch));
        }

        let good_size = node.file().metadata()?.len();

        // a second branch that never completes: open seal + garbage
        {
            let writer = BranchWriter::create(node.file(), 1, 2, Options::default())?;
            drop(writer);
            crate::file::write_all_at(node.file(), good_size + SEAL_SIZE as u64, b"garbage")?;
        }

        let reopened = Node::open(&node.path, 1, Slice::empty())?;
        assert_eq!(1, reopened.branch_count());
        assert_eq!(good_size, reopened.file().metadata()?.len());

        Ok(())
    }

    #[test]
    fn node_rotate_and_memory_read() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        node.i0().insert(v("a", "1", 1));

        let rotated = node.rotate().unwrap();
        assert!(node.i0().is_empty());
        assert!(node.i1().is_some());

        // double rotation is refused while a branch task is in flight
        node.i0().insert(v("b", "2", 2));
        assert!(node.rotate().is_none());

        // reads see both i0 and i1
        let cache = cache();
        assert!(node.point_get(b"a", u64::MAX, &cache, None)?.is_some());
        assert!(node.point_get(b"b", u64::MAX, &cache, None)?.is_some());

        drop(rotated);
        Ok(())
    }

    #[test]
    fn node_chain_spans_many_pages() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        {
            // a page per record, so the chain crosses several page
            // boundaries
            let mut writer = BranchWriter::create(
                node.file(),
                1,
                1,
                Options {
                    page_size: 8,
                    ..Options::default()
                },
            )?;

            for (lsn, delta) in [(4, "D"), (3, "C"), (2, "B")] {
                writer.write(Record::new_upsert(
                    b"k".to_vec(),
                    delta.as_bytes().to_vec(),
                    lsn,
                ))?;
            }
            writer.write(Record::from_components(
                b"k".to_vec(),
                b"A".to_vec(),
                1,
                ValueKind::Value,
            ))?;

            let branch = writer.finish()?;
            assert!(branch.pages.len() >= 4, "chain should span pages");

            node.install_branch(Arc::new(branch));
        }

        let concat: crate::upsert::UpsertFn =
            std::sync::Arc::new(|_key, existing, delta| {
                let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
                out.extend_from_slice(delta);
                Some(Slice::from(out))
            });

        // the walk must reach the base on the last page, not fall
        // through to an older branch
        let got = node
            .point_get(b"k", u64::MAX, &cache(), Some(&concat))?
            .unwrap();
        assert_eq!(b"ABCD", &*got.value);

        Ok(())
    }

    #[test]
    fn node_resident_promotion_serves_reads() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        {
            let mut writer = BranchWriter::create(node.file(), 1, 1, Options::default())?;
            writer.write(v("a", "1", 1))?;
            node.install_branch(Arc::new(writer.finish()?));
        }

        node.promote_resident()?;
        assert!(node.is_resident());

        // fresh cache, so the read must come from the promoted bytes
        let got = node.point_get(b"a", u64::MAX, &cache(), None)?;
        assert_eq!(b"1", &*got.unwrap().value);

        node.drop_resident();
        assert!(!node.is_resident());

        Ok(())
    }
}
