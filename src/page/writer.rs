// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{PageHeader, DESCRIPTOR_SIZE, FLAG_DUP};
use crate::{
    coding::Encode, compression::CompressionType, Checksum, Record, Slice, UserKey,
};

/// A finished page, ready to be appended to a node file
pub struct BuiltPage {
    /// Full on-disk bytes (header + stored body)
    pub bytes: Vec<u8>,

    pub header: PageHeader,

    /// First user key in the page (empty for an empty page)
    pub min_key: UserKey,

    /// Last user key in the page (empty for an empty page)
    pub max_key: UserKey,
}

/// Accumulates records into one page until the page-size watermark is
/// reached
///
/// For each record the builder writes a fixed descriptor slot and the
/// payload; in sparse mode the user key bytes of a version chain are
/// stored once per page and shared by all its descriptors.
pub struct PageBuilder {
    records: Vec<Record>,
    approximate_size: usize,
    page_size: usize,
    compression: CompressionType,
    sparse: bool,
}

impl PageBuilder {
    #[must_use]
    pub fn new(page_size: usize, compression: CompressionType, sparse: bool) -> Self {
        Self {
            records: vec![],
            approximate_size: 0,
            page_size,
            compression,
            sparse,
        }
    }

    /// Adds a record. Returns `true` once the page is full.
    ///
    /// Records must be pushed in `(user key asc, LSN desc)` order.
    pub fn push(&mut self, record: Record) -> bool {
        debug_assert!(
            self.records
                .last()
                .is_none_or(|prev| prev.key <= record.key),
            "records must be pushed in order",
        );

        self.approximate_size +=
            DESCRIPTOR_SIZE + record.key.user_key.len() + record.value.len();
        self.records.push(record);

        self.approximate_size >= self.page_size
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Closes the page: lays out descriptors and the key/value heap,
    /// computes aggregates and checksum, optionally compresses the body.
    pub fn build(self) -> crate::Result<BuiltPage> {
        let count = self.records.len();

        let mut body = vec![0u8; count * DESCRIPTOR_SIZE];

        let mut dup_count = 0u32;
        let mut min_lsn = u64::MAX;
        let mut max_lsn = 0u64;
        let mut min_dup_lsn = u64::MAX;
        let mut min_timestamp = u32::MAX;

        let mut prev_key: Option<(UserKey, u32, u16)> = None;

        for (idx, record) in self.records.iter().enumerate() {
            let (key_offset, key_len, is_dup) = match &prev_key {
                // NOTE: the stream is sorted, so a repeated key is always
                // adjacent; sparse mode reuses its heap bytes
                Some((key, offset, len)) if self.sparse && *key == record.key.user_key => {
                    (*offset, *len, true)
                }
                Some((key, _, _)) if *key == record.key.user_key => {
                    let offset = body.len() as u32;
                    body.extend_from_slice(&record.key.user_key);

                    #[allow(clippy::cast_possible_truncation)]
                    (offset, record.key.user_key.len() as u16, true)
                }
                _ => {
                    let offset = body.len() as u32;
                    body.extend_from_slice(&record.key.user_key);

                    #[allow(clippy::cast_possible_truncation)]
                    (offset, record.key.user_key.len() as u16, false)
                }
            };

            prev_key = Some((record.key.user_key.clone(), key_offset, key_len));

            let value_offset = body.len() as u32;
            body.extend_from_slice(&record.value);

            if is_dup {
                dup_count += 1;
                min_dup_lsn = min_dup_lsn.min(record.key.lsn);
            }

            min_lsn = min_lsn.min(record.key.lsn);
            max_lsn = max_lsn.max(record.key.lsn);
            min_timestamp = min_timestamp.min(record.timestamp);

            let slot = idx * DESCRIPTOR_SIZE;

            #[allow(clippy::indexing_slicing, clippy::cast_possible_truncation)]
            {
                body[slot..slot + 4].copy_from_slice(&key_offset.to_be_bytes());
                body[slot + 4..slot + 6].copy_from_slice(&key_len.to_be_bytes());
                body[slot + 6] = u8::from(record.key.kind);
                body[slot + 7] = if is_dup { FLAG_DUP } else { 0 };
                body[slot + 8..slot + 12].copy_from_slice(&value_offset.to_be_bytes());
                body[slot + 12..slot + 16]
                    .copy_from_slice(&(record.value.len() as u32).to_be_bytes());
                body[slot + 16..slot + 24].copy_from_slice(&record.key.lsn.to_be_bytes());
                body[slot + 24..slot + 28].copy_from_slice(&record.timestamp.to_be_bytes());
            }
        }

        let original_size = body.len();

        let stored = if self.compression == CompressionType::None {
            body
        } else {
            self.compression.compress(&body)?
        };

        let header = PageHeader {
            compression: self.compression,
            checksum: Checksum::of(&stored),
            #[allow(clippy::cast_possible_truncation)]
            item_count: count as u32,
            dup_count,
            #[allow(clippy::cast_possible_truncation)]
            stored_size: stored.len() as u32,
            #[allow(clippy::cast_possible_truncation)]
            original_size: original_size as u32,
            min_lsn: if count == 0 { 0 } else { min_lsn },
            max_lsn,
            min_dup_lsn,
            min_timestamp: if count == 0 { 0 } else { min_timestamp },
        };

        let mut bytes = Vec::with_capacity(PageHeader::serialized_len() + stored.len());
        header.encode_into(&mut bytes)?;
        bytes.extend_from_slice(&stored);

        let min_key = self
            .records
            .first()
            .map_or_else(Slice::empty, |r| r.key.user_key.clone());
        let max_key = self
            .records
            .last()
            .map_or_else(Slice::empty, |r| r.key.user_key.clone());

        Ok(BuiltPage {
            bytes,
            header,
            min_key,
            max_key,
        })
    }
}
