// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The snapshot fastpath file (`index`), one per database folder
//!
//! A consistent listing of node identities and their branch trailers,
//! copied verbatim. On recover, any node whose file size and id still
//! match is rebuilt from the snapshot and skips the tail-scan of its
//! file.

use crate::{
    branch::{Branch, BranchTrailer},
    coding::{Decode, DecodeError, Encode},
    file::{rename_durable, MAGIC_BYTES, SNAPSHOT_FILE},
    node::Node,
    Checksum, UserKey,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// One node's entry in the snapshot file
pub struct SnapshotNode {
    pub id: u64,

    /// Node file size at snapshot time; a mismatch at recover invalidates
    /// the entry
    pub file_size: u64,

    pub temperature: u32,
    pub routing_key: UserKey,

    /// `(branch id, start offset, trailer)` per branch, newest first
    pub branches: Vec<(u64, u64, BranchTrailer)>,
}

/// Writes the snapshot for a set of nodes, atomically replacing the
/// previous one via `index.incomplete`.
pub fn write_snapshot(folder: &Path, nodes: &[Arc<Node>]) -> crate::Result<()> {
    let mut out: Vec<u8> = vec![];

    out.write_all(&MAGIC_BYTES)?;
    out.write_u8(u8::from(crate::FormatVersion::V1))?;

    #[allow(clippy::cast_possible_truncation)]
    out.write_u32::<BigEndian>(nodes.len() as u32)?;

    for node in nodes {
        let branches = node.branches();

        out.write_u64::<BigEndian>(node.id)?;
        out.write_u64::<BigEndian>(node.file().metadata()?.len())?;

        #[allow(clippy::cast_possible_truncation)]
        out.write_u32::<BigEndian>(branches.len() as u32)?;
        out.write_u32::<BigEndian>(node.temperature())?;

        #[allow(clippy::cast_possible_truncation)]
        out.write_u16::<BigEndian>(node.routing_key.len() as u16)?;
        out.write_all(&node.routing_key)?;

        for branch in branches {
            let trailer = BranchTrailer {
                meta: branch.meta.clone(),
                pages: branch.pages.clone(),
                filter_blob: branch
                    .filter
                    .as_ref()
                    .map(|filter| filter.to_blob().into()),
            };

            let trailer_bytes = trailer.encode_into_vec();

            out.write_u64::<BigEndian>(branch.id)?;
            out.write_u64::<BigEndian>(branch.start_offset)?;

            #[allow(clippy::cast_possible_truncation)]
            out.write_u32::<BigEndian>(trailer_bytes.len() as u32)?;
            out.write_all(&trailer_bytes)?;
        }
    }

    let checksum = Checksum::of(&out);
    out.write_u64::<BigEndian>(*checksum)?;

    let incomplete = folder.join(format!("{SNAPSHOT_FILE}.incomplete"));
    std::fs::write(&incomplete, &out)?;

    rename_durable(&incomplete, &folder.join(SNAPSHOT_FILE))?;

    log::debug!("wrote snapshot for {} nodes at {folder:?}", nodes.len());

    Ok(())
}

/// Reads the snapshot file, if present and intact.
pub fn read_snapshot(folder: &Path) -> crate::Result<Option<Vec<SnapshotNode>>> {
    let path = folder.join(SNAPSHOT_FILE);

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if bytes.len() < MAGIC_BYTES.len() + 1 + 4 + 8 {
        return Ok(None);
    }

    let (body, footer) = bytes.split_at(bytes.len() - 8);

    #[allow(clippy::expect_used)]
    let stored = u64::from_be_bytes(footer.try_into().expect("footer is 8 bytes"));

    if *Checksum::of(body) != stored {
        log::warn!("snapshot file at {folder:?} is corrupt; falling back to tail scan");
        return Ok(None);
    }

    let mut reader = body;

    let mut magic = [0u8; MAGIC_BYTES.len()];
    std::io::Read::read_exact(&mut reader, &mut magic)?;

    if magic != MAGIC_BYTES {
        return Ok(None);
    }

    let version = reader.read_u8()?;
    if crate::FormatVersion::try_from(version).is_err() {
        return Ok(None);
    }

    let node_count = reader.read_u32::<BigEndian>()?;
    let mut nodes = Vec::with_capacity(node_count as usize);

    for _ in 0..node_count {
        let id = reader.read_u64::<BigEndian>()?;
        let file_size = reader.read_u64::<BigEndian>()?;
        let branch_count = reader.read_u32::<BigEndian>()?;
        let temperature = reader.read_u32::<BigEndian>()?;

        let key_len = reader.read_u16::<BigEndian>()? as usize;
        let routing_key = crate::Slice::from_reader(&mut reader, key_len)?;

        let mut branches = Vec::with_capacity(branch_count as usize);

        for _ in 0..branch_count {
            let branch_id = reader.read_u64::<BigEndian>()?;
            let start_offset = reader.read_u64::<BigEndian>()?;
            let trailer_len = reader.read_u32::<BigEndian>()? as usize;

            let trailer_bytes = crate::Slice::from_reader(&mut reader, trailer_len)?;
            let trailer = BranchTrailer::decode_from(&mut &trailer_bytes[..])
                .map_err(|_| DecodeError::InvalidHeader("Snapshot"))?;

            branches.push((branch_id, start_offset, trailer));
        }

        nodes.push(SnapshotNode {
            id,
            file_size,
            temperature,
            routing_key,
            branches,
        });
    }

    Ok(Some(nodes))
}

/// Rebuilds a node from its snapshot entry, bypassing the tail scan.
///
/// Returns `None` if the node file changed since the snapshot was taken.
pub fn node_from_snapshot(folder: &Path, entry: &SnapshotNode) -> crate::Result<Option<Arc<Node>>> {
    let path = folder.join(crate::file::node_file_name(entry.id));

    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if metadata.len() != entry.file_size {
        return Ok(None);
    }

    let branches = entry
        .branches
        .iter()
        .map(|(id, start_offset, trailer)| {
            Branch::from_trailer(*id, *start_offset, trailer.clone()).map(Arc::new)
        })
        .collect::<crate::Result<Vec<_>>>()?;

    let node = Node::open_with_branches(&path, entry.id, entry.routing_key.clone(), branches)?;

    Ok(Some(node))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::branch::writer::{BranchWriter, Options};
    use crate::{node::PageCache, Record, Slice, ValueKind};
    use test_log::test;

    #[test]
    fn snapshot_roundtrip_serves_reads() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        {
            let mut writer = BranchWriter::create(node.file(), 1, 1, Options::default())?;
            writer.write(Record::from_components(
                *b"a",
                *b"1",
                1,
                ValueKind::Value,
            ))?;
            node.install_branch(Arc::new(writer.finish()?));
        }

        write_snapshot(dir.path(), &[node.clone()])?;

        let entries = read_snapshot(dir.path())?.unwrap();
        assert_eq!(1, entries.len());

        let restored = node_from_snapshot(dir.path(), &entries[0])?.unwrap();
        assert_eq!(1, restored.branch_count());

        let cache = PageCache::new(8);
        let got = restored.point_get(b"a", u64::MAX, &cache, None)?;
        assert_eq!(b"1", &*got.unwrap().value);

        Ok(())
    }

    #[test]
    fn snapshot_mismatching_file_size_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        {
            let mut writer = BranchWriter::create(node.file(), 1, 1, Options::default())?;
            writer.write(Record::from_components(
                *b"a",
                *b"1",
                1,
                ValueKind::Value,
            ))?;
            node.install_branch(Arc::new(writer.finish()?));
        }

        write_snapshot(dir.path(), &[node.clone()])?;

        // grow the file behind the snapshot's back
        {
            let mut writer = BranchWriter::create(node.file(), 1, 2, Options::default())?;
            writer.write(Record::from_components(
                *b"b",
                *b"2",
                2,
                ValueKind::Value,
            ))?;
            node.install_branch(Arc::new(writer.finish()?));
        }

        let entries = read_snapshot(dir.path())?.unwrap();
        assert!(node_from_snapshot(dir.path(), &entries[0])?.is_none());

        Ok(())
    }

    #[test]
    fn snapshot_corrupt_file_is_ignored() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let node = Node::create(dir.path(), 1, Slice::empty())?;

        write_snapshot(dir.path(), &[node])?;

        let path = dir.path().join(SNAPSHOT_FILE);
        let mut bytes = std::fs::read(&path)?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes)?;

        assert!(read_snapshot(dir.path())?.is_none());

        Ok(())
    }
}
