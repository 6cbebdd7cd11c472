// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Ordering,
    io::{Read, Write},
};

/// Key of an index entry: stream hash and event number
///
/// Keys are ordered the way they are stored in tables, which is
/// *descending* by (stream hash, event number).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct IndexKey {
    /// Hash of the stream ID
    pub stream: u64,

    /// Event number inside the stream
    pub version: i64,
}

impl IndexKey {
    /// Creates a key
    #[must_use]
    pub fn new(stream: u64, version: i64) -> Self {
        Self { stream, version }
    }

    /// First key of the given stream in table order (highest event number)
    #[must_use]
    pub fn first_of(stream: u64) -> Self {
        Self::new(stream, i64::MAX)
    }

    /// Last key of the given stream in table order (lowest event number)
    #[must_use]
    pub fn last_of(stream: u64) -> Self {
        Self::new(stream, i64::MIN)
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.stream, other.version).cmp(&(self.stream, self.version))
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Maps an event of a stream to its position in the log
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    /// Hash of the stream ID
    pub stream: u64,

    /// Event number inside the stream
    pub version: i64,

    /// Log position of the event's record
    pub position: i64,
}

impl IndexEntry {
    /// Serialized size of an entry
    pub const SIZE: usize = 24;

    /// Creates an entry
    #[must_use]
    pub fn new(stream: u64, version: i64, position: i64) -> Self {
        Self {
            stream,
            version,
            position,
        }
    }

    /// Key of the entry
    #[must_use]
    pub fn key(&self) -> IndexKey {
        IndexKey::new(self.stream, self.version)
    }

    pub(crate) fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.stream)?;
        writer.write_i64::<LittleEndian>(self.version)?;
        writer.write_i64::<LittleEndian>(self.position)
    }

    pub(crate) fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let stream = reader.read_u64::<LittleEndian>()?;
        let version = reader.read_i64::<LittleEndian>()?;
        let position = reader.read_i64::<LittleEndian>()?;

        Ok(Self {
            stream,
            version,
            position,
        })
    }
}
