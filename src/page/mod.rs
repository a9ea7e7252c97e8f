// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod writer;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    compression::CompressionType,
    file::MAGIC_BYTES,
    key::InternalKey,
    Checksum, Lsn, Record, Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Fixed size of one record descriptor slot inside a page
pub const DESCRIPTOR_SIZE: usize = 28;

/// Descriptor flag bit: this record shares its user key with a
/// higher-LSN sibling earlier in the page
pub const FLAG_DUP: u8 = 1;

/// Header of a disk-based page, stored in clear even when the body is
/// compressed
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Compression type used for the body
    pub compression: CompressionType,

    /// Checksum over the stored (possibly compressed) body
    pub checksum: Checksum,

    /// Number of records
    pub item_count: u32,

    /// Number of records that are not their key's chain head within this
    /// page
    pub dup_count: u32,

    /// Stored size of the body
    pub stored_size: u32,

    /// Uncompressed size of the body
    pub original_size: u32,

    /// Lowest LSN of any record
    pub min_lsn: Lsn,

    /// Highest LSN of any record
    pub max_lsn: Lsn,

    /// Lowest LSN of any DUP record (`u64::MAX` if none)
    pub min_dup_lsn: Lsn,

    /// Lowest record timestamp, used by TTL expiry
    pub min_timestamp: u32,
}

impl PageHeader {
    #[must_use]
    pub const fn serialized_len() -> usize {
        MAGIC_BYTES.len()
            // NOTE: Compression is 2 bytes
            + 2
            // Checksum
            + std::mem::size_of::<u64>()
            // Item count + dup count
            + 2 * std::mem::size_of::<u32>()
            // Stored + original size
            + 2 * std::mem::size_of::<u32>()
            // Min, max, min-dup LSN
            + 3 * std::mem::size_of::<u64>()
            // Min timestamp
            + std::mem::size_of::<u32>()
    }
}

impl Encode for PageHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;

        self.compression.encode_into(writer)?;

        writer.write_u64::<BigEndian>(*self.checksum)?;

        writer.write_u32::<BigEndian>(self.item_count)?;
        writer.write_u32::<BigEndian>(self.dup_count)?;

        writer.write_u32::<BigEndian>(self.stored_size)?;
        writer.write_u32::<BigEndian>(self.original_size)?;

        writer.write_u64::<BigEndian>(self.min_lsn)?;
        writer.write_u64::<BigEndian>(self.max_lsn)?;
        writer.write_u64::<BigEndian>(self.min_dup_lsn)?;

        writer.write_u32::<BigEndian>(self.min_timestamp)?;

        Ok(())
    }
}

impl Decode for PageHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Page"));
        }

        let compression = CompressionType::decode_from(reader)?;

        let checksum = reader.read_u64::<BigEndian>()?;

        let item_count = reader.read_u32::<BigEndian>()?;
        let dup_count = reader.read_u32::<BigEndian>()?;

        let stored_size = reader.read_u32::<BigEndian>()?;
        let original_size = reader.read_u32::<BigEndian>()?;

        let min_lsn = reader.read_u64::<BigEndian>()?;
        let max_lsn = reader.read_u64::<BigEndian>()?;
        let min_dup_lsn = reader.read_u64::<BigEndian>()?;

        let min_timestamp = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            compression,
            checksum: Checksum::from_raw(checksum),
            item_count,
            dup_count,
            stored_size,
            original_size,
            min_lsn,
            max_lsn,
            min_dup_lsn,
            min_timestamp,
        })
    }
}

/// A decoded page: record descriptors plus their key/value payload
///
/// Record lookup is a binary search over the fixed-size descriptor array;
/// record materialization is allocation-free (the returned [`Record`]
/// shares the page body).
#[derive(Clone)]
pub struct Page {
    pub header: PageHeader,

    /// Uncompressed body: descriptor array followed by the key/value heap
    body: Slice,
}

impl Page {
    /// Parses a page from its on-disk bytes (header + stored body).
    ///
    /// Verifies the checksum and decompresses the body if needed.
    pub fn decode_from_bytes(bytes: &Slice) -> crate::Result<Self> {
        let mut reader = &bytes[..];
        let header = PageHeader::decode_from(&mut reader)?;

        let header_len = PageHeader::serialized_len();
        let stored_end = header_len + header.stored_size as usize;

        if bytes.len() < stored_end {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader("Page")));
        }

        let stored = bytes.slice(header_len..stored_end);

        Checksum::of(&stored).check(header.checksum)?;

        let body = if header.compression == CompressionType::None {
            stored
        } else {
            header
                .compression
                .decompress(&stored, header.original_size as usize)?
                .into()
        };

        Ok(Self { header, body })
    }

    /// Number of records in the page.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.item_count as usize
    }

    /// Whether the page holds no records. An empty page is valid and
    /// iterates as an empty sequence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.item_count == 0
    }

    fn descriptor(&self, idx: usize) -> &[u8] {
        let start = idx * DESCRIPTOR_SIZE;

        #[allow(clippy::indexing_slicing)]
        &self.body[start..start + DESCRIPTOR_SIZE]
    }

    fn field_u32(d: &[u8], at: usize) -> u32 {
        #[allow(clippy::indexing_slicing, clippy::expect_used)]
        u32::from_be_bytes(d[at..at + 4].try_into().expect("descriptor is fixed size"))
    }

    fn field_u64(d: &[u8], at: usize) -> u64 {
        #[allow(clippy::indexing_slicing, clippy::expect_used)]
        u64::from_be_bytes(d[at..at + 8].try_into().expect("descriptor is fixed size"))
    }

    fn field_u16(d: &[u8], at: usize) -> u16 {
        #[allow(clippy::indexing_slicing, clippy::expect_used)]
        u16::from_be_bytes(d[at..at + 2].try_into().expect("descriptor is fixed size"))
    }

    /// The user key bytes of record `idx`.
    #[must_use]
    pub fn key_at(&self, idx: usize) -> &[u8] {
        let d = self.descriptor(idx);
        let offset = Self::field_u32(d, 0) as usize;
        let len = Self::field_u16(d, 4) as usize;

        #[allow(clippy::indexing_slicing)]
        &self.body[offset..offset + len]
    }

    /// The LSN of record `idx`.
    #[must_use]
    pub fn lsn_at(&self, idx: usize) -> Lsn {
        Self::field_u64(self.descriptor(idx), 16)
    }

    /// Whether record `idx` carries the DUP flag.
    #[must_use]
    pub fn is_dup(&self, idx: usize) -> bool {
        self.descriptor(idx)[7] & FLAG_DUP != 0
    }

    /// Materializes record `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds or the descriptor is corrupt
    /// beyond what the checksum caught.
    #[must_use]
    pub fn get(&self, idx: usize) -> Record {
        let d = self.descriptor(idx);

        let key_offset = Self::field_u32(d, 0) as usize;
        let key_len = Self::field_u16(d, 4) as usize;

        #[allow(clippy::indexing_slicing, clippy::expect_used)]
        let kind = d[6].try_into().expect("checksummed page has valid kinds");

        let value_offset = Self::field_u32(d, 8) as usize;
        let value_len = Self::field_u32(d, 12) as usize;
        let lsn = Self::field_u64(d, 16);
        let timestamp = Self::field_u32(d, 24);

        Record {
            key: InternalKey {
                user_key: self.body.slice(key_offset..key_offset + key_len),
                lsn,
                kind,
            },
            value: self.body.slice(value_offset..value_offset + value_len),
            timestamp,
        }
    }

    /// Index of the first record at or after `(key, vlsn)` in the page's
    /// `(user key asc, LSN desc)` order.
    ///
    /// With `vlsn == u64::MAX` this lands on the chain head of `key`;
    /// binary searching never lands *inside* a DUP run that way.
    #[must_use]
    pub fn lower_bound(&self, key: &[u8], vlsn: Lsn) -> usize {
        let mut lo = 0;
        let mut hi = self.len();

        while lo < hi {
            let mid = (lo + hi) / 2;

            let before = match self.key_at(mid).cmp(key) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => self.lsn_at(mid) > vlsn,
            };

            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        lo
    }

    /// Index one past the last record whose key is ≤ `key`.
    #[must_use]
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.len();

        while lo < hi {
            let mid = (lo + hi) / 2;

            if self.key_at(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        lo
    }

    /// Iterates all records.
    #[must_use]
    pub fn iter(&self) -> PageIter {
        PageIter::new(self.clone(), 0, self.len())
    }

    /// Iterates records in `[lo, hi)`.
    #[must_use]
    pub fn range(&self, lo: usize, hi: usize) -> PageIter {
        PageIter::new(self.clone(), lo, hi.min(self.len()))
    }
}

/// Double-ended iterator over a page's records
pub struct PageIter {
    page: Page,
    front: usize,
    back: usize,
}

impl PageIter {
    fn new(page: Page, front: usize, back: usize) -> Self {
        Self { page, front, back }
    }
}

impl Iterator for PageIter {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }

        let record = self.page.get(self.front);
        self.front += 1;
        Some(record)
    }
}

impl DoubleEndedIterator for PageIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }

        self.back -= 1;
        Some(self.page.get(self.back))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::writer::PageBuilder;
    use super::*;
    use crate::ValueKind;
    use test_log::test;

    fn build_page(records: &[Record]) -> Page {
        let mut builder = PageBuilder::new(64 * 1024, CompressionType::None, true);

        for record in records {
            builder.push(record.clone());
        }

        let built = builder.build().unwrap();
        Page::decode_from_bytes(&Slice::from(built.bytes)).unwrap()
    }

    fn v(key: &str, value: &str, lsn: u64) -> Record {
        Record::from_components(key.as_bytes(), value.as_bytes(), lsn, ValueKind::Value)
    }

    #[test]
    fn page_roundtrip() {
        let records = [v("a", "1", 1), v("b", "2", 2), v("c", "3", 3)];
        let page = build_page(&records);

        assert_eq!(3, page.len());

        for (idx, record) in records.iter().enumerate() {
            let got = page.get(idx);
            assert_eq!(record.key, got.key);
            assert_eq!(record.value, got.value);
        }
    }

    #[test]
    fn page_empty_is_valid() {
        let builder = PageBuilder::new(4096, CompressionType::None, true);
        let built = builder.build().unwrap();

        let page = Page::decode_from_bytes(&Slice::from(built.bytes)).unwrap();
        assert!(page.is_empty());
        assert_eq!(0, page.iter().count());
    }

    #[test]
    fn page_binary_search() {
        let records = [
            v("a", "1", 1),
            v("b", "head", 7),
            v("b", "mid", 5),
            v("b", "old", 2),
            v("d", "1", 1),
        ];
        let page = build_page(&records);

        // chain head
        assert_eq!(1, page.lower_bound(b"b", u64::MAX));
        // newest visible at vlsn = 5
        assert_eq!(2, page.lower_bound(b"b", 5));
        // between keys
        assert_eq!(4, page.lower_bound(b"c", u64::MAX));
        // past the end
        assert_eq!(5, page.lower_bound(b"e", u64::MAX));
    }

    #[test]
    fn page_dup_marking() {
        let records = [
            v("a", "1", 1),
            v("b", "head", 7),
            v("b", "old", 2),
        ];
        let page = build_page(&records);

        assert!(!page.is_dup(0));
        assert!(!page.is_dup(1));
        assert!(page.is_dup(2));

        assert_eq!(1, page.header.dup_count);
        assert_eq!(2, page.header.min_dup_lsn);
    }

    #[test]
    fn page_key_dedup_shares_heap() {
        let long_key = "k".repeat(512);

        let records = [
            v(&long_key, "head", 9),
            v(&long_key, "old", 1),
            v("z", "1", 1),
        ];

        let mut builder = PageBuilder::new(64 * 1024, CompressionType::None, true);
        let mut raw_builder = PageBuilder::new(64 * 1024, CompressionType::None, false);

        for record in &records {
            builder.push(record.clone());
            raw_builder.push(record.clone());
        }

        let sparse = builder.build().unwrap();
        let raw = raw_builder.build().unwrap();

        // sparse storage stores the long key once
        assert!(sparse.bytes.len() + 400 < raw.bytes.len());

        let page = Page::decode_from_bytes(&Slice::from(sparse.bytes)).unwrap();
        assert_eq!(long_key.as_bytes(), page.key_at(0));
        assert_eq!(long_key.as_bytes(), page.key_at(1));
    }

    #[test]
    fn page_iter_both_directions() {
        let records = [v("a", "1", 1), v("b", "2", 2), v("c", "3", 3)];
        let page = build_page(&records);

        let forward = page.iter().map(|r| r.key.lsn).collect::<Vec<_>>();
        assert_eq!(vec![1, 2, 3], forward);

        let backward = page.iter().rev().map(|r| r.key.lsn).collect::<Vec<_>>();
        assert_eq!(vec![3, 2, 1], backward);
    }
}
