// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::DecodeError;
use std::{borrow::Cow, io::Write};

#[cfg(feature = "lz4")]
const LZ4_TRANSFORM_MAGIC: [u8; 4] = *b"LZ4B";

#[cfg(feature = "lz4")]
const LZ4_TRANSFORM_VERSION: u32 = 1;

/// Byte transform applied to the record bodies of a chunk
///
/// The transform is chosen when a chunk is created and stored in its header,
/// so chunks written with different transforms can live in the same database.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ChunkTransform {
    /// Bytes are stored as-is
    #[default]
    Identity,

    /// Record bodies are compressed using LZ4
    #[cfg(feature = "lz4")]
    Lz4,
}

impl From<ChunkTransform> for u8 {
    fn from(value: ChunkTransform) -> Self {
        match value {
            ChunkTransform::Identity => 0,

            #[cfg(feature = "lz4")]
            ChunkTransform::Lz4 => 1,
        }
    }
}

impl TryFrom<u8> for ChunkTransform {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Identity),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            _ => Err(crate::Error::UnsupportedTransform(value)),
        }
    }
}

impl ChunkTransform {
    /// Size of the transform specific header written once per chunk, after the chunk header
    #[must_use]
    pub fn header_size(self) -> usize {
        match self {
            Self::Identity => 0,

            #[cfg(feature = "lz4")]
            Self::Lz4 => LZ4_TRANSFORM_MAGIC.len() + std::mem::size_of::<u32>(),
        }
    }

    pub(crate) fn write_header<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Self::Identity => Ok(()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => {
                use byteorder::{LittleEndian, WriteBytesExt};

                writer.write_all(&LZ4_TRANSFORM_MAGIC)?;
                writer.write_u32::<LittleEndian>(LZ4_TRANSFORM_VERSION)
            }
        }
    }

    /// Returns `true` if the given bytes are a valid transform header
    pub(crate) fn validate_header(self, bytes: &[u8]) -> bool {
        match self {
            Self::Identity => bytes.is_empty(),

            #[cfg(feature = "lz4")]
            Self::Lz4 => {
                let mut expected = Vec::with_capacity(self.header_size());

                // NOTE: Writing into a Vec can't fail
                #[allow(clippy::expect_used)]
                self.write_header(&mut expected).expect("should write");

                bytes == expected
            }
        }
    }

    /// Maps a record body to the bytes that are persisted
    pub(crate) fn encode<'a>(self, body: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            Self::Identity => Cow::Borrowed(body),

            #[cfg(feature = "lz4")]
            Self::Lz4 => Cow::Owned(lz4_flex::compress_prepend_size(body)),
        }
    }

    /// Maps persisted bytes back to the record body
    pub(crate) fn decode<'a>(self, bytes: &'a [u8]) -> Result<Cow<'a, [u8]>, DecodeError> {
        match self {
            Self::Identity => Ok(Cow::Borrowed(bytes)),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(bytes)
                .map(Cow::Owned)
                .map_err(|e| DecodeError::Decompress(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn identity_is_passthrough() -> crate::Result<()> {
        let body = b"hello world";

        let encoded = ChunkTransform::Identity.encode(body);
        assert_eq!(body, &*encoded);
        assert_eq!(body, &*ChunkTransform::Identity.decode(&encoded)?);
        assert_eq!(0, ChunkTransform::Identity.header_size());

        Ok(())
    }

    #[test]
    fn unknown_tag() {
        assert!(matches!(
            ChunkTransform::try_from(200),
            Err(crate::Error::UnsupportedTransform(200))
        ));
    }

    #[test]
    #[cfg(feature = "lz4")]
    fn lz4_compresses() -> crate::Result<()> {
        let body = vec![7u8; 4_096];

        let encoded = ChunkTransform::Lz4.encode(&body);
        assert!(encoded.len() < body.len());
        assert_eq!(body, &*ChunkTransform::Lz4.decode(&encoded)?);

        let mut header = vec![];
        ChunkTransform::Lz4.write_header(&mut header)?;
        assert_eq!(ChunkTransform::Lz4.header_size(), header.len());
        assert!(ChunkTransform::Lz4.validate_header(&header));
        assert!(!ChunkTransform::Lz4.validate_header(&[0; 8]));

        Ok(())
    }
}
