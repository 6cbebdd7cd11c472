// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{Cursor, Read, Write},
    path::Path,
};

/// Size of the chunk footer, including the trailing hash
pub const CHUNK_FOOTER_SIZE: usize = 128;

/// Size of the MD5 hash stored at the end of the footer
pub const CHUNK_HASH_SIZE: usize = 16;

const FLAG_COMPLETED: u8 = 0b01;
const FLAG_HAS_POS_MAP: u8 = 0b10;

/// Fixed-size trailer written when a chunk is completed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChunkFooter {
    /// Whether the chunk was completed
    pub is_completed: bool,

    /// Whether a position map precedes the footer
    pub has_pos_map: bool,

    /// Bytes of record frames stored in the data region
    pub physical_data_size: i32,

    /// Logical extent of the chunk data (equals the physical size unless scavenged)
    pub logical_data_size: i64,

    /// Size of the position map in bytes
    pub map_size: i32,

    /// MD5 of every byte of the file before the hash
    pub hash: [u8; CHUNK_HASH_SIZE],
}

impl ChunkFooter {
    /// Serializes the footer without its hash
    #[must_use]
    pub fn encode_without_hash(&self) -> [u8; CHUNK_FOOTER_SIZE - CHUNK_HASH_SIZE] {
        let mut buf = [0; CHUNK_FOOTER_SIZE - CHUNK_HASH_SIZE];

        let mut flags = 0;
        if self.is_completed {
            flags |= FLAG_COMPLETED;
        }
        if self.has_pos_map {
            flags |= FLAG_HAS_POS_MAP;
        }

        let mut writer = Cursor::new(&mut buf[..]);

        // NOTE: The buffer is large enough for all fields
        #[allow(clippy::expect_used)]
        {
            writer.write_u8(flags).expect("should fit");
            writer
                .write_i32::<LittleEndian>(self.physical_data_size)
                .expect("should fit");
            writer
                .write_i64::<LittleEndian>(self.logical_data_size)
                .expect("should fit");
            writer
                .write_i32::<LittleEndian>(self.map_size)
                .expect("should fit");
        }

        buf
    }

    /// Parses a footer
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::BadChunkInDatabase`] if the footer is truncated.
    pub fn decode(path: &Path, bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != CHUNK_FOOTER_SIZE {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!("chunk footer has {} bytes", bytes.len()),
            });
        }

        let mut reader = Cursor::new(bytes);

        let flags = reader.read_u8()?;
        let physical_data_size = reader.read_i32::<LittleEndian>()?;
        let logical_data_size = reader.read_i64::<LittleEndian>()?;
        let map_size = reader.read_i32::<LittleEndian>()?;

        let mut hash = [0; CHUNK_HASH_SIZE];
        reader.set_position((CHUNK_FOOTER_SIZE - CHUNK_HASH_SIZE) as u64);
        reader.read_exact(&mut hash)?;

        Ok(Self {
            is_completed: flags & FLAG_COMPLETED != 0,
            has_pos_map: flags & FLAG_HAS_POS_MAP != 0,
            physical_data_size,
            logical_data_size,
            map_size,
            hash,
        })
    }
}

/// Maps a logical record offset of a scavenged chunk to where the record is actually stored
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct PosMapEntry {
    /// Offset the record had before scavenging
    pub logical: i32,

    /// Offset of the record in the scavenged data region
    pub actual: i32,
}

impl PosMapEntry {
    /// Serialized size
    pub const SIZE: usize = 8;

    pub(crate) fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<LittleEndian>(self.logical)?;
        writer.write_i32::<LittleEndian>(self.actual)
    }

    pub(crate) fn decode_all(bytes: &[u8]) -> std::io::Result<Vec<Self>> {
        let mut reader = Cursor::new(bytes);
        let mut entries = Vec::with_capacity(bytes.len() / Self::SIZE);

        for _ in 0..(bytes.len() / Self::SIZE) {
            let logical = reader.read_i32::<LittleEndian>()?;
            let actual = reader.read_i32::<LittleEndian>()?;
            entries.push(Self { logical, actual });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn chunk_footer_serde() -> crate::Result<()> {
        let footer = ChunkFooter {
            is_completed: true,
            has_pos_map: true,
            physical_data_size: 500,
            logical_data_size: 1_000,
            map_size: 16,
            hash: [5; CHUNK_HASH_SIZE],
        };

        let mut bytes = footer.encode_without_hash().to_vec();
        bytes.extend_from_slice(&footer.hash);
        assert_eq!(CHUNK_FOOTER_SIZE, bytes.len());
        assert_eq!(0b11, bytes[0]);

        assert_eq!(footer, ChunkFooter::decode(Path::new("x"), &bytes)?);

        Ok(())
    }

    #[test]
    fn zeroed_footer_is_not_completed() -> crate::Result<()> {
        let footer = ChunkFooter::decode(Path::new("x"), &[0; CHUNK_FOOTER_SIZE])?;
        assert!(!footer.is_completed);
        assert!(!footer.has_pos_map);
        Ok(())
    }

    #[test]
    fn pos_map_serde() -> crate::Result<()> {
        let entries = [
            PosMapEntry {
                logical: 0,
                actual: 0,
            },
            PosMapEntry {
                logical: 120,
                actual: 40,
            },
        ];

        let mut bytes = vec![];
        for entry in &entries {
            entry.encode_into(&mut bytes)?;
        }
        assert_eq!(16, bytes.len());

        assert_eq!(entries.to_vec(), PosMapEntry::decode_all(&bytes)?);

        Ok(())
    }
}
