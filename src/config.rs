// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    compression::CompressionType,
    wal::{Durability, RecoveryMode},
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Ordering policy of the compaction planner
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompactMode {
    /// Prefer nodes whose memory index is largest (branching pressure)
    #[default]
    BranchPriority,

    /// Prefer nodes with the most branches
    CountPriority,

    /// Only checkpoint-driven flushes; no reordering by branch count
    CheckpointOnly,
}

/// Environment configuration
///
/// All knobs here are offline-only: they are fixed once
/// [`open`](Config::open) returns.
#[derive(Clone)]
pub struct Config {
    /// Environment directory (databases and the WAL live beneath it)
    pub path: PathBuf,

    /// Backup root; `None` disables backups
    pub backup_path: Option<PathBuf>,

    /// Memory quota for write buffers in bytes (0 = unlimited)
    pub memory_limit: u64,

    /// How long a producer waits on the quota before giving up
    pub quota_timeout: Duration,

    /// Target page size in bytes
    pub page_size: usize,

    /// Node-size watermark; a merge writer exceeding it splits the node
    pub node_size: u64,

    /// Memory-index size that triggers a branch task
    pub branch_watermark: u64,

    /// Branch count that triggers a compact task
    pub compact_watermark: usize,

    pub compact_mode: CompactMode,

    /// A memory index older than this (and larger than
    /// `age_watermark`) is flushed by the age rule
    pub age_period: Duration,
    pub age_watermark: u64,

    /// Periodic checkpoint interval (`None` disables the periodic
    /// trigger; explicit checkpoints stay available)
    pub checkpoint_period: Option<Duration>,

    /// TTL in seconds; records older than this expire
    pub expire_ttl: Option<u32>,
    pub expire_period: Duration,

    /// Branch dup-ratio above which a gc compaction is scheduled
    pub gc_dup_ratio: f32,
    pub gc_period: Duration,

    /// LRU horizon step per pass (0 disables the lru rule)
    pub lru_step: u64,

    /// Temperature below which the anticache policy revokes promoted
    /// nodes, and above which it promotes them
    pub anticache_cold: u32,
    pub anticache_hot: u32,

    pub wal_enabled: bool,
    pub wal_rotate_watermark: u32,
    pub durability: Durability,
    pub recovery: RecoveryMode,

    pub compression: CompressionType,

    /// Store each user key once per page (dup-suppression dictionary)
    pub sparse_pages: bool,

    /// Bits per key of the per-branch membership filter (`None`
    /// disables the extension)
    pub filter_bpk: Option<f32>,

    /// Background worker threads (0 disables background processing;
    /// tasks then only run through explicit env calls)
    pub worker_threads: usize,

    /// Decoded pages held in the shared cache
    pub page_cache_capacity: usize,

    /// Scheduler pause when no task is runnable
    pub idle_tick: Duration,
}

impl Config {
    /// Creates the default configuration rooted at `path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            backup_path: None,
            memory_limit: 0,
            quota_timeout: Duration::from_secs(30),
            page_size: 64 * 1024,
            node_size: 64 * 1024 * 1024,
            branch_watermark: 8 * 1024 * 1024,
            compact_watermark: 4,
            compact_mode: CompactMode::default(),
            age_period: Duration::from_secs(40),
            age_watermark: 1024 * 1024,
            checkpoint_period: None,
            expire_ttl: None,
            expire_period: Duration::from_secs(1),
            gc_dup_ratio: 0.5,
            gc_period: Duration::from_secs(60),
            lru_step: 0,
            anticache_cold: 10,
            anticache_hot: 80,
            wal_enabled: true,
            wal_rotate_watermark: 500_000,
            durability: Durability::default(),
            recovery: RecoveryMode::default(),
            compression: CompressionType::default(),
            sparse_pages: true,
            filter_bpk: Some(10.0),
            worker_threads: 2,
            page_cache_capacity: 1024,
            idle_tick: Duration::from_millis(10),
        }
    }

    /// Sets the memory quota in bytes (0 = unlimited).
    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Sets the backup root directory.
    #[must_use]
    pub fn backup_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.backup_path = Some(path.as_ref().into());
        self
    }

    /// Sets the target page size in bytes.
    #[must_use]
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the node-split watermark in bytes.
    #[must_use]
    pub fn node_size(mut self, bytes: u64) -> Self {
        self.node_size = bytes;
        self
    }

    /// Sets the memory-index size that triggers branching.
    #[must_use]
    pub fn branch_watermark(mut self, bytes: u64) -> Self {
        self.branch_watermark = bytes;
        self
    }

    /// Sets the branch count that triggers compaction.
    #[must_use]
    pub fn compact_watermark(mut self, branches: usize) -> Self {
        self.compact_watermark = branches;
        self
    }

    /// Selects the compaction ordering policy.
    #[must_use]
    pub fn compact_mode(mut self, mode: CompactMode) -> Self {
        self.compact_mode = mode;
        self
    }

    /// Sets the TTL for record expiry, in seconds.
    #[must_use]
    pub fn expire_ttl(mut self, secs: u32) -> Self {
        self.expire_ttl = Some(secs);
        self
    }

    /// Enables or disables the WAL.
    #[must_use]
    pub fn wal(mut self, enabled: bool) -> Self {
        self.wal_enabled = enabled;
        self
    }

    /// Sets the default durability of commits.
    #[must_use]
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the recovery mode applied at open.
    #[must_use]
    pub fn recovery(mut self, mode: RecoveryMode) -> Self {
        self.recovery = mode;
        self
    }

    /// Sets page compression.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the number of background workers.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Enables the LRU horizon rule with the given step.
    #[must_use]
    pub fn lru_step(mut self, step: u64) -> Self {
        self.lru_step = step;
        self
    }

    /// Opens the environment.
    pub fn open(self) -> crate::Result<crate::Env> {
        crate::Env::open(self)
    }
}
