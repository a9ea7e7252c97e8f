// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression applied to the body of a page (the page header stays in
/// clear)
///
/// The "none" filter is a valid, fast no-op.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// LZ4 compression (speed-optimized)
    #[cfg(feature = "lz4")]
    Lz4,
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => {
                writer.write_u8(0)?;
                writer.write_u8(0)?;
            }

            #[cfg(feature = "lz4")]
            Self::Lz4 => {
                writer.write_u8(1)?;
                writer.write_u8(0)?;
            }
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        let _ = reader.read_u8()?; // reserved

        match tag {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",
            }
        )
    }
}

impl CompressionType {
    /// Compresses a buffer.
    pub fn compress(self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(lz4_flex::compress(data)),
        }
    }

    /// Decompresses a buffer of known original size.
    pub fn decompress(self, data: &[u8], original_size: usize) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress(data, original_size)
                .map_err(|_| crate::Error::Decompress(self)),
        }
    }
}
