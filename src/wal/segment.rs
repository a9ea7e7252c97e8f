// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    key::InternalKey,
    mvcc::DbId,
    Lsn, Record, Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Mutex,
    },
};
use varint_rs::{VarintReader, VarintWriter};

/// Record flag: an ordinary single write
pub const FLAG_WRITE: u8 = 0;

/// Record flag: framing marker opening a multi-statement batch;
/// `size` carries the write count and the payload is empty
pub const FLAG_BEGIN: u8 = 1;

/// Fixed WAL record header size (checksum + lsn + dsn + size + timestamp
/// + flags, padded to word alignment)
pub const RECORD_HEADER_SIZE: usize = 32;

/// Version stamp at the start of every segment file
pub const SEGMENT_STAMP_SIZE: usize = MAGIC_BYTES.len() + 1;

/// One entry of a WAL segment
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    pub lsn: Lsn,

    /// Owning database id
    pub dsn: DbId,

    pub timestamp: u32,
    pub flags: u8,

    /// `kind || varint key || varint value` for writes, empty for BEGIN
    pub payload: Slice,

    /// For BEGIN frames: number of writes in the batch
    pub batch_len: u32,
}

impl WalRecord {
    /// Wraps a committed write.
    #[must_use]
    pub fn from_write(db: DbId, record: &Record) -> Self {
        let mut payload = Vec::with_capacity(record.key.user_key.len() + record.value.len() + 11);

        #[allow(clippy::expect_used)]
        {
            payload.push(u8::from(record.key.kind));
            payload
                .write_u32_varint(record.key.user_key.len() as u32)
                .expect("vec write cannot fail");
            payload.extend_from_slice(&record.key.user_key);
            payload
                .write_u32_varint(record.value.len() as u32)
                .expect("vec write cannot fail");
            payload.extend_from_slice(&record.value);
        }

        Self {
            lsn: record.key.lsn,
            dsn: db,
            timestamp: record.timestamp,
            flags: FLAG_WRITE,
            payload: payload.into(),
            batch_len: 0,
        }
    }

    /// The framing record opening a batch of `write_count` writes.
    #[must_use]
    pub fn begin_frame(lsn: Lsn, write_count: u32, timestamp: u32) -> Self {
        Self {
            lsn,
            dsn: 0,
            timestamp,
            flags: FLAG_BEGIN,
            payload: Slice::empty(),
            batch_len: write_count,
        }
    }

    /// Decodes the payload back into a record.
    pub fn to_record(&self) -> Result<Record, DecodeError> {
        let mut reader = &self.payload[..];

        let kind = reader.read_u8()?;
        let kind = kind
            .try_into()
            .map_err(|()| DecodeError::InvalidTag(("ValueKind", kind)))?;

        let key_len = reader.read_u32_varint()? as usize;
        let user_key = Slice::from_reader(&mut reader, key_len)?;

        let value_len = reader.read_u32_varint()? as usize;
        let value = Slice::from_reader(&mut reader, value_len)?;

        Ok(Record {
            key: InternalKey {
                user_key,
                lsn: self.lsn,
                kind,
            },
            value,
            timestamp: self.timestamp,
        })
    }
}

impl Encode for WalRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut header = Vec::with_capacity(RECORD_HEADER_SIZE - 8);

        header.write_u64::<BigEndian>(self.lsn)?;
        header.write_u32::<BigEndian>(self.dsn)?;

        let size = if self.flags == FLAG_BEGIN {
            self.batch_len
        } else {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.payload.len() as u32
            }
        };
        header.write_u32::<BigEndian>(size)?;

        header.write_u32::<BigEndian>(self.timestamp)?;
        header.write_u8(self.flags)?;
        header.write_all(&[0u8; 3])?; // padding

        let mut hasher = crate::checksum::ChecksummedWriter::new(std::io::sink());

        #[allow(clippy::expect_used)]
        {
            hasher.write_all(&header).expect("sink cannot fail");
            hasher.write_all(&self.payload).expect("sink cannot fail");
        }

        writer.write_u64::<BigEndian>(*hasher.checksum())?;
        writer.write_all(&header)?;
        writer.write_all(&self.payload)?;

        Ok(())
    }
}

impl Decode for WalRecord {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let checksum = reader.read_u64::<BigEndian>()?;

        let mut header = [0u8; RECORD_HEADER_SIZE - 8];
        reader.read_exact(&mut header)?;

        let mut cursor = &header[..];
        let lsn = cursor.read_u64::<BigEndian>()?;
        let dsn = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u32::<BigEndian>()?;
        let timestamp = cursor.read_u32::<BigEndian>()?;
        let flags = cursor.read_u8()?;

        let (payload, batch_len) = if flags == FLAG_BEGIN {
            (Slice::empty(), size)
        } else {
            (Slice::from_reader(reader, size as usize)?, 0)
        };

        let mut hasher = crate::checksum::ChecksummedWriter::new(std::io::sink());

        #[allow(clippy::expect_used)]
        {
            hasher.write_all(&header).expect("sink cannot fail");
            hasher.write_all(&payload).expect("sink cannot fail");
        }

        if *hasher.checksum() != checksum {
            return Err(DecodeError::InvalidHeader("WalRecord"));
        }

        Ok(Self {
            lsn,
            dsn,
            timestamp,
            flags,
            payload,
            batch_len,
        })
    }
}

/// One append-only WAL segment file
///
/// Only the newest segment of the pool receives appends; the file-level
/// mutex is held for the duration of a single append.
pub struct Segment {
    pub id: u64,
    pub path: PathBuf,

    file: Mutex<File>,

    record_count: AtomicU32,
    max_lsn: AtomicU64,

    /// No further appends; eligible for sweep once durable
    complete: AtomicBool,
}

impl Segment {
    /// Creates a fresh segment with its version stamp.
    pub fn create(folder: &Path, id: u64) -> crate::Result<Self> {
        let path = folder.join(crate::file::wal_file_name(id));

        let mut file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.write_all(&MAGIC_BYTES)?;
        file.write_all(&[u8::from(crate::FormatVersion::V1)])?;
        file.sync_all()?;
        crate::file::fsync_directory(folder)?;

        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            record_count: AtomicU32::new(0),
            max_lsn: AtomicU64::new(0),
            complete: AtomicBool::new(false),
        })
    }

    /// Opens an existing segment for recovery and further bookkeeping.
    pub fn open(path: &Path, id: u64) -> crate::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            record_count: AtomicU32::new(0),
            max_lsn: AtomicU64::new(0),
            complete: AtomicBool::new(false),
        })
    }

    /// Appends a batch: a single record, or a BEGIN frame followed by one
    /// record per write.
    ///
    /// Returns the new record count of the segment.
    pub fn append(&self, writes: &[(DbId, Record)], fsync: bool) -> crate::Result<u32> {
        #[allow(clippy::expect_used)]
        let mut file = self.file.lock().expect("lock is poisoned");

        let mut buf = vec![];

        if writes.len() > 1 {
            #[allow(clippy::expect_used)]
            let (_, first) = writes.first().expect("batch is non-empty");

            #[allow(clippy::cast_possible_truncation)]
            WalRecord::begin_frame(first.key.lsn, writes.len() as u32, first.timestamp)
                .encode_into(&mut buf)?;
        }

        for (db, record) in writes {
            WalRecord::from_write(*db, record).encode_into(&mut buf)?;
        }

        file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        file.flush()?;

        if fsync {
            file.sync_data()?;
        }

        for (_, record) in writes {
            self.max_lsn.fetch_max(record.key.lsn, Ordering::AcqRel);
        }

        #[allow(clippy::cast_possible_truncation)]
        let added = writes.len() as u32 + u32::from(writes.len() > 1);

        Ok(self.record_count.fetch_add(added, Ordering::AcqRel) + added)
    }

    /// Reads all intact records, stopping at end-of-file or the first
    /// checksum mismatch.
    ///
    /// A batch whose BEGIN frame announces more records than survive is
    /// dropped entirely.
    pub fn read_all(&self) -> crate::Result<Vec<WalRecord>> {
        #[allow(clippy::expect_used)]
        let mut file = self.file.lock().expect("lock is poisoned");

        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);

        let mut stamp = [0u8; SEGMENT_STAMP_SIZE];
        reader.read_exact(&mut stamp)?;

        #[allow(clippy::indexing_slicing)]
        if stamp[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                "WalSegment",
            )));
        }

        let mut records = vec![];
        let mut pending_batch: Option<(u32, Vec<WalRecord>)> = None;

        loop {
            match WalRecord::decode_from(&mut reader) {
                Ok(record) => {
                    if record.flags == FLAG_BEGIN {
                        // an unfinished batch before a new frame is torn
                        pending_batch = Some((record.batch_len, vec![]));
                        continue;
                    }

                    match &mut pending_batch {
                        Some((expected, batch)) => {
                            batch.push(record);

                            if batch.len() as u32 == *expected {
                                #[allow(clippy::expect_used)]
                                let (_, batch) =
                                    pending_batch.take().expect("batch is present");
                                records.extend(batch);
                            }
                        }
                        None => records.push(record),
                    }
                }
                Err(e) => {
                    if !matches!(
                        &e,
                        DecodeError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
                    ) {
                        log::warn!(
                            "wal segment {}: stopping replay at corrupt record ({e})",
                            self.id,
                        );
                    }

                    break;
                }
            }
        }

        if pending_batch.is_some() {
            log::warn!("wal segment {}: dropping torn trailing batch", self.id);
        }

        #[allow(clippy::cast_possible_truncation)]
        self.record_count
            .store(records.len() as u32, Ordering::Release);

        if let Some(max) = records.iter().map(|r| r.lsn).max() {
            self.max_lsn.fetch_max(max, Ordering::AcqRel);
        }

        Ok(records)
    }

    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn.load(Ordering::Acquire)
    }

    /// Marks the segment as rotated away; no further appends.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Syncs pending appends.
    pub fn sync(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let file = self.file.lock().expect("lock is poisoned");
        file.sync_data()?;
        Ok(())
    }
}
