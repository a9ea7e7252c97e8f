// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod filter;
pub mod writer;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    Checksum, Lsn, Slice, UserKey,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use filter::BranchFilter;
use std::io::{Read, Write};

/// Size of a seal marker on disk
pub const SEAL_SIZE: usize = 50;

/// Trailer extension bit: approximate-membership filter
pub const EXT_FILTER: u32 = 1;

/// The open/close marker bracketing a branch inside a node file
///
/// The open seal is written before the first page with placeholder trailer
/// fields and back-patched once the branch completes; the close seal
/// follows the trailer and is what recovery keys on to prove the branch is
/// durable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Seal {
    /// `false` for the open marker, `true` for the close marker
    pub closed: bool,

    pub node_id: u64,
    pub branch_id: u64,

    /// Absolute file offset of the branch-index trailer (0 in an
    /// unpatched open seal)
    pub trailer_offset: u64,

    /// Size of the trailer in bytes
    pub trailer_size: u32,

    /// Checksum over the trailer bytes
    pub trailer_checksum: Checksum,
}

impl Seal {
    /// A fresh open seal with placeholder trailer fields.
    #[must_use]
    pub fn open(node_id: u64, branch_id: u64) -> Self {
        Self {
            closed: false,
            node_id,
            branch_id,
            trailer_offset: 0,
            trailer_size: 0,
            trailer_checksum: Checksum::default(),
        }
    }

    /// The close counterpart of a patched open seal.
    #[must_use]
    pub fn close(&self) -> Self {
        Self {
            closed: true,
            ..self.clone()
        }
    }
}

impl Encode for Seal {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut buf = Vec::with_capacity(SEAL_SIZE);

        buf.write_all(&MAGIC_BYTES)?;
        buf.write_u8(u8::from(crate::FormatVersion::V1))?;
        buf.write_u8(u8::from(self.closed))?;
        buf.write_u64::<BigEndian>(self.node_id)?;
        buf.write_u64::<BigEndian>(self.branch_id)?;
        buf.write_u64::<BigEndian>(self.trailer_offset)?;
        buf.write_u32::<BigEndian>(self.trailer_size)?;
        buf.write_u64::<BigEndian>(*self.trailer_checksum)?;

        let checksum = Checksum::of(&buf);
        buf.write_u64::<BigEndian>(*checksum)?;

        debug_assert_eq!(SEAL_SIZE, buf.len());

        writer.write_all(&buf)?;
        Ok(())
    }
}

impl Decode for Seal {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0u8; SEAL_SIZE];
        reader.read_exact(&mut buf)?;

        #[allow(clippy::indexing_slicing)]
        let expected = Checksum::of(&buf[..SEAL_SIZE - 8]);

        let mut cursor = &buf[..];

        let mut magic = [0u8; MAGIC_BYTES.len()];
        cursor.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Seal"));
        }

        let version = cursor.read_u8()?;
        crate::FormatVersion::try_from(version)
            .map_err(|()| DecodeError::InvalidTag(("FormatVersion", version)))?;

        let closed = cursor.read_u8()? != 0;
        let node_id = cursor.read_u64::<BigEndian>()?;
        let branch_id = cursor.read_u64::<BigEndian>()?;
        let trailer_offset = cursor.read_u64::<BigEndian>()?;
        let trailer_size = cursor.read_u32::<BigEndian>()?;
        let trailer_checksum = cursor.read_u64::<BigEndian>()?;

        let stored = cursor.read_u64::<BigEndian>()?;

        if stored != *expected {
            return Err(DecodeError::InvalidHeader("Seal"));
        }

        Ok(Self {
            closed,
            node_id,
            branch_id,
            trailer_offset,
            trailer_size,
            trailer_checksum: Checksum::from_raw(trailer_checksum),
        })
    }
}

/// Aggregates of one branch, stored at the head of its trailer
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BranchMeta {
    pub item_count: u64,

    /// Distinct user keys
    pub key_count: u64,

    /// Records that are not their key's chain head within this branch
    pub dup_count: u64,

    pub page_count: u32,

    /// Stored bytes of all pages (including page headers)
    pub byte_size: u64,

    /// Uncompressed payload bytes
    pub original_size: u64,

    pub min_lsn: Lsn,
    pub max_lsn: Lsn,

    /// Lowest LSN of any DUP record (`u64::MAX` if none); the gc rule
    /// compares this against the visibility horizon
    pub min_dup_lsn: Lsn,

    pub min_timestamp: u32,
    pub max_timestamp: u32,
}

impl BranchMeta {
    /// The share of obsolete versions in this branch, driving the gc
    /// rule.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dup_ratio(&self) -> f32 {
        if self.item_count == 0 {
            0.0
        } else {
            self.dup_count as f32 / self.item_count as f32
        }
    }
}

/// Location and key range of one page inside the node file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageDescriptor {
    /// Absolute file offset of the page (header included)
    pub file_offset: u64,

    /// Stored size including the page header
    pub stored_size: u32,

    /// Uncompressed body size
    pub original_size: u32,

    /// Number of records in the page
    pub item_count: u32,

    pub min_lsn: Lsn,
    pub max_lsn: Lsn,

    pub min_key: UserKey,
    pub max_key: UserKey,
}

/// The branch-index trailer: aggregates, page descriptors, key blobs and
/// optional extensions
#[derive(Clone, Debug)]
pub struct BranchTrailer {
    pub meta: BranchMeta,
    pub pages: Vec<PageDescriptor>,
    pub filter_blob: Option<Slice>,
}

impl Encode for BranchTrailer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.meta.item_count)?;
        writer.write_u64::<BigEndian>(self.meta.key_count)?;
        writer.write_u64::<BigEndian>(self.meta.dup_count)?;
        writer.write_u32::<BigEndian>(self.meta.page_count)?;
        writer.write_u64::<BigEndian>(self.meta.byte_size)?;
        writer.write_u64::<BigEndian>(self.meta.original_size)?;
        writer.write_u64::<BigEndian>(self.meta.min_lsn)?;
        writer.write_u64::<BigEndian>(self.meta.max_lsn)?;
        writer.write_u64::<BigEndian>(self.meta.min_dup_lsn)?;
        writer.write_u32::<BigEndian>(self.meta.min_timestamp)?;
        writer.write_u32::<BigEndian>(self.meta.max_timestamp)?;

        let extensions = if self.filter_blob.is_some() {
            EXT_FILTER
        } else {
            0
        };
        writer.write_u32::<BigEndian>(extensions)?;

        // Packed fixed-size descriptors; the key bytes go into a blob
        // after the array
        let mut key_blob: Vec<u8> = vec![];

        for page in &self.pages {
            writer.write_u64::<BigEndian>(page.file_offset)?;
            writer.write_u32::<BigEndian>(page.stored_size)?;
            writer.write_u32::<BigEndian>(page.original_size)?;
            writer.write_u32::<BigEndian>(page.item_count)?;
            writer.write_u64::<BigEndian>(page.min_lsn)?;
            writer.write_u64::<BigEndian>(page.max_lsn)?;

            #[allow(clippy::cast_possible_truncation)]
            {
                writer.write_u32::<BigEndian>(key_blob.len() as u32)?;
                writer.write_u16::<BigEndian>(page.min_key.len() as u16)?;
                key_blob.extend_from_slice(&page.min_key);

                writer.write_u32::<BigEndian>(key_blob.len() as u32)?;
                writer.write_u16::<BigEndian>(page.max_key.len() as u16)?;
                key_blob.extend_from_slice(&page.max_key);
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(key_blob.len() as u32)?;
        writer.write_all(&key_blob)?;

        if let Some(blob) = &self.filter_blob {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<BigEndian>(blob.len() as u32)?;
            writer.write_all(blob)?;
        }

        Ok(())
    }
}

impl Decode for BranchTrailer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let meta = BranchMeta {
            item_count: reader.read_u64::<BigEndian>()?,
            key_count: reader.read_u64::<BigEndian>()?,
            dup_count: reader.read_u64::<BigEndian>()?,
            page_count: reader.read_u32::<BigEndian>()?,
            byte_size: reader.read_u64::<BigEndian>()?,
            original_size: reader.read_u64::<BigEndian>()?,
            min_lsn: reader.read_u64::<BigEndian>()?,
            max_lsn: reader.read_u64::<BigEndian>()?,
            min_dup_lsn: reader.read_u64::<BigEndian>()?,
            min_timestamp: reader.read_u32::<BigEndian>()?,
            max_timestamp: reader.read_u32::<BigEndian>()?,
        };

        let extensions = reader.read_u32::<BigEndian>()?;

        struct RawDescriptor {
            file_offset: u64,
            stored_size: u32,
            original_size: u32,
            item_count: u32,
            min_lsn: Lsn,
            max_lsn: Lsn,
            min_key: (u32, u16),
            max_key: (u32, u16),
        }

        let mut raw_pages = Vec::with_capacity(meta.page_count as usize);

        for _ in 0..meta.page_count {
            raw_pages.push(RawDescriptor {
                file_offset: reader.read_u64::<BigEndian>()?,
                stored_size: reader.read_u32::<BigEndian>()?,
                original_size: reader.read_u32::<BigEndian>()?,
                item_count: reader.read_u32::<BigEndian>()?,
                min_lsn: reader.read_u64::<BigEndian>()?,
                max_lsn: reader.read_u64::<BigEndian>()?,
                min_key: (
                    reader.read_u32::<BigEndian>()?,
                    reader.read_u16::<BigEndian>()?,
                ),
                max_key: (
                    reader.read_u32::<BigEndian>()?,
                    reader.read_u16::<BigEndian>()?,
                ),
            });
        }

        let key_blob_len = reader.read_u32::<BigEndian>()? as usize;
        let key_blob = Slice::from_reader(reader, key_blob_len)?;

        let cut = |(offset, len): (u32, u16)| -> Result<Slice, DecodeError> {
            let start = offset as usize;
            let end = start + len as usize;

            if end > key_blob.len() {
                return Err(DecodeError::InvalidHeader("BranchTrailer"));
            }

            Ok(key_blob.slice(start..end))
        };

        let pages = raw_pages
            .into_iter()
            .map(|raw| {
                Ok(PageDescriptor {
                    file_offset: raw.file_offset,
                    stored_size: raw.stored_size,
                    original_size: raw.original_size,
                    item_count: raw.item_count,
                    min_lsn: raw.min_lsn,
                    max_lsn: raw.max_lsn,
                    min_key: cut(raw.min_key)?,
                    max_key: cut(raw.max_key)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        let filter_blob = if extensions & EXT_FILTER != 0 {
            let len = reader.read_u32::<BigEndian>()? as usize;
            Some(Slice::from_reader(reader, len)?)
        } else {
            None
        };

        Ok(Self {
            meta,
            pages,
            filter_blob,
        })
    }
}

/// An immutable on-disk span inside a node file
///
/// Created by branch or compact tasks, never mutated, destroyed only when
/// its node is replaced. The *root* branch of a node is the last in the
/// chain (nothing older lies beneath it).
pub struct Branch {
    pub id: u64,

    /// File offset of the open seal
    pub start_offset: u64,

    pub meta: BranchMeta,
    pub pages: Vec<PageDescriptor>,
    pub filter: Option<BranchFilter>,
}

impl Branch {
    /// Builds a branch from its decoded trailer.
    pub fn from_trailer(id: u64, start_offset: u64, trailer: BranchTrailer) -> crate::Result<Self> {
        let filter = trailer
            .filter_blob
            .as_ref()
            .map(BranchFilter::decode)
            .transpose()?;

        Ok(Self {
            id,
            start_offset,
            meta: trailer.meta,
            pages: trailer.pages,
            filter,
        })
    }

    /// Whether the filter (if any) rules out the key.
    #[must_use]
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        self.filter.as_ref().is_none_or(|f| f.contains(key))
    }

    /// Index of the page that could contain `key`, for point reads.
    #[must_use]
    pub fn find_page(&self, key: &[u8]) -> Option<usize> {
        let idx = self.pages.partition_point(|page| &*page.max_key < key);

        let page = self.pages.get(idx)?;

        if &*page.min_key <= key {
            Some(idx)
        } else {
            None
        }
    }

    /// Index of the first page whose range reaches `key` or beyond, for
    /// range scans.
    #[must_use]
    pub fn lower_page(&self, key: &[u8]) -> usize {
        self.pages.partition_point(|page| &*page.max_key < key)
    }

    /// Index of the last page whose range starts at or before `key`,
    /// for reverse scans.
    #[must_use]
    pub fn upper_page(&self, key: &[u8]) -> usize {
        self.pages.partition_point(|page| &*page.min_key <= key)
    }

    /// First user key of the branch.
    #[must_use]
    pub fn min_key(&self) -> Option<&UserKey> {
        self.pages.first().map(|p| &p.min_key)
    }

    /// Last user key of the branch.
    #[must_use]
    pub fn max_key(&self) -> Option<&UserKey> {
        self.pages.last().map(|p| &p.max_key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn seal_roundtrip() {
        let seal = Seal {
            closed: true,
            node_id: 3,
            branch_id: 9,
            trailer_offset: 1024,
            trailer_size: 256,
            trailer_checksum: Checksum::from_raw(42),
        };

        let bytes = seal.encode_into_vec();
        assert_eq!(SEAL_SIZE, bytes.len());

        let decoded = Seal::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(seal, decoded);
    }

    #[test]
    fn seal_detects_corruption() {
        let seal = Seal::open(1, 1);
        let mut bytes = seal.encode_into_vec();
        bytes[10] ^= 0xFF;

        assert!(Seal::decode_from(&mut &bytes[..]).is_err());
    }

    #[test]
    fn trailer_roundtrip() {
        let trailer = BranchTrailer {
            meta: BranchMeta {
                item_count: 10,
                key_count: 8,
                dup_count: 2,
                page_count: 2,
                byte_size: 4096,
                original_size: 8000,
                min_lsn: 1,
                max_lsn: 99,
                min_dup_lsn: 5,
                min_timestamp: 1000,
                max_timestamp: 2000,
            },
            pages: vec![
                PageDescriptor {
                    file_offset: 50,
                    stored_size: 2048,
                    original_size: 4000,
                    item_count: 5,
                    min_lsn: 1,
                    max_lsn: 50,
                    min_key: Slice::from("aaa"),
                    max_key: Slice::from("mmm"),
                },
                PageDescriptor {
                    file_offset: 2098,
                    stored_size: 2048,
                    original_size: 4000,
                    item_count: 5,
                    min_lsn: 2,
                    max_lsn: 99,
                    min_key: Slice::from("nnn"),
                    max_key: Slice::from("zzz"),
                },
            ],
            filter_blob: Some(Slice::from(vec![0u8; 32])),
        };

        let bytes = trailer.encode_into_vec();
        let decoded = BranchTrailer::decode_from(&mut &bytes[..]).unwrap();

        assert_eq!(trailer.meta, decoded.meta);
        assert_eq!(trailer.pages, decoded.pages);
        assert_eq!(trailer.filter_blob, decoded.filter_blob);
    }

    #[test]
    fn branch_page_lookup() {
        let page = |min: &str, max: &str| PageDescriptor {
            file_offset: 0,
            stored_size: 0,
            original_size: 0,
            item_count: 0,
            min_lsn: 0,
            max_lsn: 0,
            min_key: Slice::from(min),
            max_key: Slice::from(max),
        };

        let branch = Branch {
            id: 1,
            start_offset: 0,
            meta: BranchMeta::default(),
            pages: vec![page("b", "d"), page("f", "h")],
            filter: None,
        };

        assert_eq!(Some(0), branch.find_page(b"b"));
        assert_eq!(Some(0), branch.find_page(b"c"));
        assert_eq!(Some(1), branch.find_page(b"g"));

        // between pages / outside the branch
        assert_eq!(None, branch.find_page(b"a"));
        assert_eq!(None, branch.find_page(b"e"));
        assert_eq!(None, branch.find_page(b"z"));

        // range positioning clamps instead
        assert_eq!(0, branch.lower_page(b"a"));
        assert_eq!(1, branch.lower_page(b"e"));
        assert_eq!(2, branch.lower_page(b"z"));
    }
}
