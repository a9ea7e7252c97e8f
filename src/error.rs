// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    compression::CompressionType,
    format_version::FormatVersion,
    Checksum,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// Invalid or unparsable data format version
    InvalidVersion(FormatVersion),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum computed over the read bytes
        got: Checksum,
        /// Checksum stored on disk
        expected: Checksum,
    },

    /// Caller error: bad schema, bad key shape, double upsert in one
    /// transaction, operation on a closed database, and the like
    BadRequest(&'static str),

    /// The database rejected the operation because a background task
    /// previously hit an I/O error or corrupted data structure
    Malfunction,

    /// The environment or database is shutting down
    Shutdown,

    /// Some required node files could not be recovered from disk
    Unrecoverable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TundraError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
