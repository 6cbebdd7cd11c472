// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::transform::ChunkTransform;
use crate::{
    version::{parse_file_header, write_file_header, FileType, HeaderError, Version},
    InvalidFileError,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Cursor, Write},
    path::Path,
};

/// Size of the chunk header
pub const CHUNK_HEADER_SIZE: usize = 128;

/// Fixed-size header at the start of every chunk file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChunkHeader {
    /// Disk format version
    pub version: Version,

    /// Logical capacity of the chunk in bytes
    pub chunk_size: i32,

    /// First chunk number covered by this file
    pub chunk_start_number: i32,

    /// Last chunk number covered by this file
    pub chunk_end_number: i32,

    /// Whether records were removed from the chunk
    pub is_scavenged: bool,

    /// Transform applied to record bodies
    pub transform: ChunkTransform,
}

impl ChunkHeader {
    /// Global log position of the first byte of this chunk
    #[must_use]
    pub fn chunk_start_position(&self) -> i64 {
        i64::from(self.chunk_start_number) * i64::from(self.chunk_size)
    }

    /// Global log position one past the last byte of this chunk
    #[must_use]
    pub fn chunk_end_position(&self) -> i64 {
        (i64::from(self.chunk_end_number) + 1) * i64::from(self.chunk_size)
    }

    /// Returns `true` if the global log position falls into this chunk
    #[must_use]
    pub fn contains(&self, position: i64) -> bool {
        position >= self.chunk_start_position() && position < self.chunk_end_position()
    }

    /// Serializes the header, padded to [`CHUNK_HEADER_SIZE`]
    #[must_use]
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0; CHUNK_HEADER_SIZE];

        // NOTE: The buffer is large enough for all fields
        #[allow(clippy::expect_used)]
        self.encode_into(&mut Cursor::new(&mut buf[..]))
            .expect("header should fit");

        buf
    }

    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write_file_header(writer, FileType::Chunk, self.version)?;
        writer.write_i32::<LittleEndian>(self.chunk_size)?;
        writer.write_i32::<LittleEndian>(self.chunk_start_number)?;
        writer.write_i32::<LittleEndian>(self.chunk_end_number)?;
        writer.write_u8(u8::from(self.is_scavenged))?;
        writer.write_u8(u8::from(self.transform))?;
        Ok(())
    }

    /// Parses a chunk header
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidFile`] if the file is not a chunk,
    /// [`crate::Error::UnsupportedFileVersion`] if its version is unknown.
    pub fn decode(path: &Path, bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(crate::Error::InvalidFile(InvalidFileError {
                path: path.to_path_buf(),
                reason: format!("chunk header too short ({} bytes)", bytes.len()),
            }));
        }

        let version = parse_file_header(bytes, FileType::Chunk).map_err(|e| match e {
            HeaderError::FileType(ft) => crate::Error::InvalidFile(InvalidFileError {
                path: path.to_path_buf(),
                reason: format!("unknown file type {ft}"),
            }),
            HeaderError::Version(version) => crate::Error::UnsupportedFileVersion {
                path: path.to_path_buf(),
                version,
            },
        })?;

        #[allow(clippy::indexing_slicing)]
        let mut reader = Cursor::new(&bytes[2..]);

        let chunk_size = reader.read_i32::<LittleEndian>()?;
        let chunk_start_number = reader.read_i32::<LittleEndian>()?;
        let chunk_end_number = reader.read_i32::<LittleEndian>()?;
        let is_scavenged = reader.read_u8()? != 0;
        let transform = ChunkTransform::try_from(reader.read_u8()?)?;

        if chunk_size <= 0 || chunk_start_number < 0 || chunk_end_number < chunk_start_number {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!(
                    "invalid chunk range {chunk_start_number}-{chunk_end_number} (size {chunk_size})"
                ),
            });
        }

        Ok(Self {
            version,
            chunk_size,
            chunk_start_number,
            chunk_end_number,
            is_scavenged,
            transform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn header() -> ChunkHeader {
        ChunkHeader {
            version: Version::CURRENT,
            chunk_size: 1_024,
            chunk_start_number: 3,
            chunk_end_number: 3,
            is_scavenged: true,
            transform: ChunkTransform::Identity,
        }
    }

    #[test]
    fn chunk_header_serde() -> crate::Result<()> {
        let header = header();
        let bytes = header.encode();

        assert_eq!(CHUNK_HEADER_SIZE, bytes.len());
        assert_eq!(2, bytes[0]);
        assert_eq!(header, ChunkHeader::decode(Path::new("x"), &bytes)?);

        Ok(())
    }

    #[test]
    fn chunk_header_positions() {
        let header = header();
        assert_eq!(3_072, header.chunk_start_position());
        assert_eq!(4_096, header.chunk_end_position());
        assert!(header.contains(3_072));
        assert!(header.contains(4_095));
        assert!(!header.contains(4_096));
    }

    #[test]
    fn chunk_header_rejects_unknown_type() {
        let mut bytes = header().encode();
        bytes[0] = 77;

        assert!(matches!(
            ChunkHeader::decode(Path::new("x"), &bytes),
            Err(crate::Error::InvalidFile(_))
        ));
    }

    #[test]
    fn chunk_header_rejects_unknown_version() {
        let mut bytes = header().encode();
        bytes[1] = 9;

        assert!(matches!(
            ChunkHeader::decode(Path::new("x"), &bytes),
            Err(crate::Error::UnsupportedFileVersion { version: 9, .. })
        ));
    }

    #[test]
    fn chunk_header_rejects_unknown_transform() {
        let mut bytes = header().encode();
        bytes[15] = 99;

        assert!(matches!(
            ChunkHeader::decode(Path::new("x"), &bytes),
            Err(crate::Error::UnsupportedTransform(99))
        ));
    }
}
