// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Write-ahead log: an append-only pool of numbered segment files
//!
//! Only the newest segment receives appends. Rotation is triggered by a
//! record-count watermark; segments whose records are all durable in
//! branches are deleted by a background sweep.

pub mod segment;

use crate::{lsn::LsnCounter, mvcc::DbId, Lsn, Record};
use segment::Segment;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// How hard an append pushes towards the platter
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    /// Leave flushing to the OS
    None,

    /// Write the bytes into the file (survives a process crash)
    #[default]
    Buffer,

    /// `fdatasync` every append (survives power loss)
    Fsync,
}

/// Recovery behavior at open
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RecoveryMode {
    /// Full replay in one pass
    #[default]
    Eager,

    /// Metadata-only first phase; records are replayed on first access
    /// of each database (second phase)
    TwoPhase,

    /// Discard the log (reset)
    None,
}

/// The segment pool
pub struct Wal {
    folder: PathBuf,

    /// Oldest to newest; the last entry is the active segment
    segments: Mutex<Vec<Arc<Segment>>>,

    next_id: LsnCounter,

    /// Rotation watermark (records per segment)
    rotate_watermark: u32,

    durability: Durability,
}

impl Wal {
    /// Opens the pool, scanning every existing segment.
    pub fn open(folder: &Path, rotate_watermark: u32, durability: Durability) -> crate::Result<Self> {
        std::fs::create_dir_all(folder)?;

        let mut segments = vec![];

        for (name, path) in crate::file::sorted_file_names(folder)? {
            let Some(id) = name
                .strip_suffix(".log")
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };

            segments.push(Arc::new(Segment::open(&path, id)?));
        }

        segments.sort_by_key(|segment| segment.id);

        let max_id = segments.last().map_or(0, |segment| segment.id);

        let wal = Self {
            folder: folder.to_path_buf(),
            segments: Mutex::new(segments),
            next_id: LsnCounter::new(max_id),
            rotate_watermark,
            durability,
        };

        log::debug!(
            "opened wal at {folder:?} with {} segments",
            wal.segment_count(),
        );

        Ok(wal)
    }

    /// Replays every segment oldest to newest, applying each intact
    /// record, then rotates to a fresh empty segment.
    ///
    /// Returns the highest LSN seen.
    pub fn replay(
        &self,
        mut apply: impl FnMut(DbId, Record) -> crate::Result<()>,
    ) -> crate::Result<Lsn> {
        let segments = {
            #[allow(clippy::expect_used)]
            self.segments.lock().expect("lock is poisoned").clone()
        };

        let mut max_lsn = 0;

        for segment in &segments {
            let records = segment.read_all()?;

            log::debug!("replaying {} records from segment {}", records.len(), segment.id);

            for wal_record in records {
                max_lsn = max_lsn.max(wal_record.lsn);
                apply(wal_record.dsn, wal_record.to_record()?)?;
            }

            segment.mark_complete();
        }

        self.rotate()?;

        Ok(max_lsn)
    }

    /// Discards all segments (recovery mode `None`).
    pub fn reset(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut segments = self.segments.lock().expect("lock is poisoned");

        for segment in segments.drain(..) {
            std::fs::remove_file(&segment.path)?;
        }

        let id = self.next_id.next();
        segments.push(Arc::new(Segment::create(&self.folder, id)?));

        Ok(())
    }

    /// Appends a committed batch to the active segment, rotating past the
    /// watermark.
    pub fn append(
        &self,
        writes: &[(DbId, Record)],
        durability: Option<Durability>,
    ) -> crate::Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let durability = durability.unwrap_or(self.durability);

        #[allow(clippy::expect_used)]
        let mut segments = self.segments.lock().expect("lock is poisoned");

        if segments.is_empty() {
            let id = self.next_id.next();
            segments.push(Arc::new(Segment::create(&self.folder, id)?));
        }

        #[allow(clippy::expect_used)]
        let active = segments.last().expect("pool is non-empty").clone();

        let count = active.append(writes, durability == Durability::Fsync)?;

        if count >= self.rotate_watermark {
            active.mark_complete();
            active.sync()?;

            let id = self.next_id.next();
            segments.push(Arc::new(Segment::create(&self.folder, id)?));

            log::debug!("rotated wal to segment {id}");
        }

        Ok(())
    }

    /// Seals the active segment and starts a fresh one (used by backup
    /// and by replay).
    pub fn rotate(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut segments = self.segments.lock().expect("lock is poisoned");

        if let Some(active) = segments.last() {
            if active.record_count() == 0 && !active.is_complete() {
                return Ok(());
            }

            active.mark_complete();
            active.sync()?;
        }

        let id = self.next_id.next();
        segments.push(Arc::new(Segment::create(&self.folder, id)?));

        Ok(())
    }

    /// Deletes complete segments all of whose records are durable in
    /// branches (below `durable_lsn`).
    pub fn sweep(&self, durable_lsn: Lsn) -> crate::Result<usize> {
        #[allow(clippy::expect_used)]
        let mut segments = self.segments.lock().expect("lock is poisoned");

        let mut removed = 0;
        let mut idx = 0;

        while idx < segments.len() {
            #[allow(clippy::indexing_slicing)]
            let segment = &segments[idx];

            let is_active = idx + 1 == segments.len();

            if !is_active && segment.is_complete() && segment.max_lsn() <= durable_lsn {
                log::debug!(
                    "sweeping wal segment {} (max lsn {} ≤ durable {durable_lsn})",
                    segment.id,
                    segment.max_lsn(),
                );

                std::fs::remove_file(&segment.path)?;
                segments.remove(idx);
                removed += 1;
            } else {
                idx += 1;
            }
        }

        Ok(removed)
    }

    /// Paths of all segment files, oldest first (for backup).
    #[must_use]
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        #[allow(clippy::expect_used)]
        self.segments
            .lock()
            .expect("lock is poisoned")
            .iter()
            .map(|segment| segment.path.clone())
            .collect()
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.segments.lock().expect("lock is poisoned").len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ValueKind;
    use test_log::test;

    fn rec(key: &str, value: &str, lsn: u64) -> Record {
        Record::from_components(key.as_bytes(), value.as_bytes(), lsn, ValueKind::Value)
    }

    #[test]
    fn wal_replay_restores_writes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let wal = Wal::open(dir.path(), 1000, Durability::Buffer)?;
            wal.append(&[(0, rec("a", "1", 1))], None)?;
            wal.append(&[(0, rec("b", "2", 2)), (0, rec("c", "2", 2))], None)?;
        }

        let wal = Wal::open(dir.path(), 1000, Durability::Buffer)?;

        let mut seen = vec![];
        let max_lsn = wal.replay(|db, record| {
            seen.push((db, record));
            Ok(())
        })?;

        assert_eq!(2, max_lsn);
        assert_eq!(3, seen.len());

        // replay rotated to a fresh segment
        assert_eq!(2, wal.segment_count());

        Ok(())
    }

    #[test]
    fn wal_rotates_at_watermark() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let wal = Wal::open(dir.path(), 2, Durability::Buffer)?;

        wal.append(&[(0, rec("a", "1", 1))], None)?;
        assert_eq!(1, wal.segment_count());

        wal.append(&[(0, rec("b", "2", 2))], None)?;
        assert_eq!(2, wal.segment_count());

        Ok(())
    }

    #[test]
    fn wal_sweep_removes_durable_segments() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let wal = Wal::open(dir.path(), 1, Durability::Buffer)?;

        wal.append(&[(0, rec("a", "1", 1))], None)?;
        wal.append(&[(0, rec("b", "2", 2))], None)?;
        assert_eq!(3, wal.segment_count());

        // nothing durable yet
        assert_eq!(0, wal.sweep(0)?);

        // first segment durable
        assert_eq!(1, wal.sweep(1)?);
        assert_eq!(2, wal.segment_count());

        assert_eq!(1, wal.sweep(2)?);
        assert_eq!(1, wal.segment_count());

        Ok(())
    }
}
