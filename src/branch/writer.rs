// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    filter::{hash_key, FilterBuilder},
    Branch, BranchMeta, BranchTrailer, PageDescriptor, Seal, SEAL_SIZE,
};
use crate::{
    coding::Encode, compression::CompressionType, file::write_all_at, page::writer::PageBuilder,
    Checksum, Record, UserKey,
};
use std::fs::File;

/// Tunables of one branch write
#[derive(Clone, Debug)]
pub struct Options {
    pub page_size: usize,
    pub compression: CompressionType,

    /// Store each user key once per page
    pub sparse: bool,

    /// Bits per key for the membership filter, `None` disables the
    /// extension
    pub filter_bpk: Option<f32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            compression: CompressionType::None,
            sparse: true,
            filter_bpk: Some(10.0),
        }
    }
}

/// Appends one branch (open seal, pages, trailer, close seal) to a node
/// file
///
/// Records must arrive in `(user key asc, LSN desc)` order, typically from
/// a [`RetentionStream`](crate::write_stream::RetentionStream).
pub struct BranchWriter<'a> {
    file: &'a File,
    node_id: u64,
    branch_id: u64,
    opts: Options,

    start_offset: u64,
    cursor: u64,

    builder: PageBuilder,
    pages: Vec<PageDescriptor>,

    meta: BranchMeta,
    prev_key: Option<UserKey>,

    /// Buffered primary hashes of distinct user keys; the filter size
    /// depends on the final key count, so construction is deferred
    key_hashes: Option<Vec<u64>>,
}

impl<'a> BranchWriter<'a> {
    /// Starts a branch at the end of the node file by writing an
    /// unpatched open seal.
    pub fn create(
        file: &'a File,
        node_id: u64,
        branch_id: u64,
        opts: Options,
    ) -> crate::Result<Self> {
        let start_offset = file.metadata()?.len();

        let seal = Seal::open(node_id, branch_id);
        write_all_at(file, start_offset, &seal.encode_into_vec())?;

        let builder = PageBuilder::new(opts.page_size, opts.compression, opts.sparse);
        let key_hashes = opts.filter_bpk.map(|_| vec![]);

        Ok(Self {
            file,
            node_id,
            branch_id,
            opts,
            start_offset,
            cursor: start_offset + SEAL_SIZE as u64,
            builder,
            pages: vec![],
            meta: BranchMeta {
                min_lsn: u64::MAX,
                min_dup_lsn: u64::MAX,
                min_timestamp: u32::MAX,
                ..BranchMeta::default()
            },
            prev_key: None,
            key_hashes,
        })
    }

    /// Adds a record to the branch.
    pub fn write(&mut self, record: Record) -> crate::Result<()> {
        let is_dup = self
            .prev_key
            .as_ref()
            .is_some_and(|prev| *prev == record.key.user_key);

        if is_dup {
            self.meta.dup_count += 1;
            self.meta.min_dup_lsn = self.meta.min_dup_lsn.min(record.key.lsn);
        } else {
            self.meta.key_count += 1;

            if let Some(hashes) = &mut self.key_hashes {
                hashes.push(hash_key(&record.key.user_key).0);
            }
        }

        self.prev_key = Some(record.key.user_key.clone());

        self.meta.item_count += 1;
        self.meta.min_lsn = self.meta.min_lsn.min(record.key.lsn);
        self.meta.max_lsn = self.meta.max_lsn.max(record.key.lsn);
        self.meta.min_timestamp = self.meta.min_timestamp.min(record.timestamp);
        self.meta.max_timestamp = self.meta.max_timestamp.max(record.timestamp);

        if self.builder.push(record) {
            self.flush_page()?;
        }

        Ok(())
    }

    /// Bytes appended so far (pages only; the trailer comes at finish).
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.cursor - self.start_offset
    }

    fn flush_page(&mut self) -> crate::Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }

        let builder = std::mem::replace(
            &mut self.builder,
            PageBuilder::new(self.opts.page_size, self.opts.compression, self.opts.sparse),
        );

        let built = builder.build()?;

        write_all_at(self.file, self.cursor, &built.bytes)?;

        #[allow(clippy::cast_possible_truncation)]
        self.pages.push(PageDescriptor {
            file_offset: self.cursor,
            stored_size: built.bytes.len() as u32,
            original_size: built.header.original_size,
            item_count: built.header.item_count,
            min_lsn: built.header.min_lsn,
            max_lsn: built.header.max_lsn,
            min_key: built.min_key,
            max_key: built.max_key,
        });

        self.meta.byte_size += built.bytes.len() as u64;
        self.meta.original_size += u64::from(built.header.original_size);
        self.cursor += built.bytes.len() as u64;

        Ok(())
    }

    /// Writes the trailer and both seals; the branch is durable once this
    /// returns.
    pub fn finish(mut self) -> crate::Result<Branch> {
        self.flush_page()?;

        let filter_blob = match self.key_hashes.take() {
            Some(hashes) if !hashes.is_empty() => {
                #[allow(clippy::expect_used)]
                let bpk = self.opts.filter_bpk.expect("hashes imply filter_bpk");

                let mut builder = FilterBuilder::with_bpk(hashes.len(), bpk);
                for h1 in hashes {
                    builder.insert_hash(h1);
                }

                Some(crate::Slice::from(builder.build()))
            }
            _ => None,
        };

        #[allow(clippy::cast_possible_truncation)]
        {
            self.meta.page_count = self.pages.len() as u32;
        }

        if self.meta.item_count == 0 {
            self.meta.min_lsn = 0;
            self.meta.min_timestamp = 0;
        }

        let trailer = BranchTrailer {
            meta: self.meta.clone(),
            pages: std::mem::take(&mut self.pages),
            filter_blob,
        };

        let trailer_bytes = trailer.encode_into_vec();
        let trailer_offset = self.cursor;

        write_all_at(self.file, trailer_offset, &trailer_bytes)?;

        #[allow(clippy::cast_possible_truncation)]
        let open_seal = Seal {
            closed: false,
            node_id: self.node_id,
            branch_id: self.branch_id,
            trailer_offset,
            trailer_size: trailer_bytes.len() as u32,
            trailer_checksum: Checksum::of(&trailer_bytes),
        };

        // close seal first, then back-patch the open seal; an open seal
        // pointing at a missing close seal is discarded by recovery
        let close_offset = trailer_offset + trailer_bytes.len() as u64;
        write_all_at(self.file, close_offset, &open_seal.close().encode_into_vec())?;
        write_all_at(self.file, self.start_offset, &open_seal.encode_into_vec())?;

        self.file.sync_all()?;

        log::debug!(
            "sealed branch {} of node {}: {} records in {} pages, {} bytes",
            self.branch_id,
            self.node_id,
            trailer.meta.item_count,
            trailer.meta.page_count,
            trailer.meta.byte_size,
        );

        Branch::from_trailer(self.branch_id, self.start_offset, trailer)
    }
}
