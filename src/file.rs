// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

pub const MAGIC_BYTES: [u8; 4] = [b'T', b'N', b'D', 1];

/// WAL segments live in this folder inside the environment path.
pub const LOG_FOLDER: &str = "log";

/// Snapshot fastpath file, one per database folder.
pub const SNAPSHOT_FILE: &str = "index";

/// Schema file, one per database folder.
pub const SCHEME_FILE: &str = "scheme";

/// Marker file; a database folder containing it is dropped at open.
pub const DROP_MARKER: &str = "drop";

pub const INCOMPLETE_EXT: &str = "incomplete";
pub const SEAL_EXT: &str = "seal";
pub const GC_EXT: &str = "gc";

/// `NNNNN.db`
pub fn node_file_name(id: u64) -> String {
    format!("{id:05}.db")
}

/// `PPPPP.NNNNN.db.incomplete`: compaction output of parent `PPPPP`,
/// not yet sealed.
pub fn node_incomplete_file_name(parent: u64, id: u64) -> String {
    format!("{parent:05}.{id:05}.db.{INCOMPLETE_EXT}")
}

/// `PPPPP.NNNNN.db.seal`: sealed compaction output awaiting the final
/// rename.
pub fn node_seal_file_name(parent: u64, id: u64) -> String {
    format!("{parent:05}.{id:05}.db.{SEAL_EXT}")
}

/// `NNNNN.db.gc`: replaced node awaiting unlink.
pub fn node_gc_file_name(id: u64) -> String {
    format!("{id:05}.db.{GC_EXT}")
}

/// `NNNNN.log`
pub fn wal_file_name(id: u64) -> String {
    format!("{id:05}.log")
}

/// On-disk state of a node file, derived from its name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeFileState {
    /// `NNNNN.db`: fully sealed node
    Complete { id: u64 },

    /// `PPPPP.NNNNN.db.incomplete`: compaction output never sealed
    Incomplete { parent: u64, id: u64 },

    /// `PPPPP.NNNNN.db.seal`: sealed, but the rename to final never happened
    Sealed { parent: u64, id: u64 },

    /// `NNNNN.db.gc`: post-compaction remnant
    Remnant { id: u64 },
}

/// Parses a file name in a database folder into a [`NodeFileState`].
///
/// Non-node files (`scheme`, `index`, `drop`, strays) return `None`.
pub fn parse_node_file_name(name: &str) -> Option<NodeFileState> {
    let parts = name.split('.').collect::<Vec<_>>();

    match *parts.as_slice() {
        [id, "db"] => Some(NodeFileState::Complete {
            id: id.parse().ok()?,
        }),
        [id, "db", GC_EXT] => Some(NodeFileState::Remnant {
            id: id.parse().ok()?,
        }),
        [parent, id, "db", INCOMPLETE_EXT] => Some(NodeFileState::Incomplete {
            parent: parent.parse().ok()?,
            id: id.parse().ok()?,
        }),
        [parent, id, "db", SEAL_EXT] => Some(NodeFileState::Sealed {
            parent: parent.parse().ok()?,
            id: id.parse().ok()?,
        }),
        _ => None,
    }
}

/// Reads bytes from a file using `pread`.
pub fn read_exact_at(file: &File, offset: u64, size: usize) -> std::io::Result<Slice> {
    // SAFETY: This slice builder starts uninitialized, but we know its length
    //
    // We use read_at/seek_read which give us the number of bytes read
    // If that number does not match the slice length, the function errors,
    // so the (partially) uninitialized buffer is discarded
    //
    // Additionally, page loads do a checksum check which would likely catch
    // the buffer being wrong somehow
    #[allow(unsafe_code)]
    let mut builder = unsafe { Slice::builder_unzeroed(size) };

    {
        #[cfg(unix)]
        let bytes_read = {
            use std::os::unix::fs::FileExt;
            file.read_at(&mut builder, offset)?
        };

        #[cfg(windows)]
        let bytes_read = {
            use std::os::windows::fs::FileExt;
            file.seek_read(&mut builder, offset)?
        };

        if bytes_read != size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read_exact_at({bytes_read}) at {offset} did not read enough bytes {size}; file has length {}",
                    file.metadata()?.len(),
                ),
            ));
        }
    }

    Ok(builder.freeze().into())
}

/// Writes bytes into a file at an absolute offset using `pwrite`.
pub fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut pos = 0;
        while pos < buf.len() {
            pos += file.seek_write(&buf[pos..], offset + pos as u64)?;
        }
        Ok(())
    }
}

/// Atomically rewrites a file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[allow(clippy::expect_used)]
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
        fsync_directory(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

/// Renames and fsyncs the enclosing directory so the rename is durable.
pub fn rename_durable(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::rename(src, dst)?;

    #[allow(clippy::expect_used)]
    let folder = dst.parent().expect("should have a parent");
    fsync_directory(folder)
}

/// Lists a folder's file names, lexicographically sorted.
pub fn sorted_file_names(folder: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut entries = vec![];

    for dirent in std::fs::read_dir(folder)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        entries.push((name, dirent.path()));
    }

    entries.sort();
    Ok(entries)
}
