// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::DecodeError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Immutable byte payload of an event
pub type Slice = byteview::ByteView;

/// Log position (global byte offset into the transaction log)
pub type LogPosition = i64;

/// Size of the length prefix and suffix around every record body
pub const FRAME_OVERHEAD: usize = 2 * std::mem::size_of::<u32>();

const RECORD_VERSION: u8 = 1;

/// Flags of a prepare record
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    /// No flags
    pub const NONE: Self = Self(0);

    /// The record carries event data
    pub const DATA: Self = Self(0x0001);

    /// First prepare of a transaction
    pub const TRANSACTION_BEGIN: Self = Self(0x0002);

    /// Last prepare of a transaction
    pub const TRANSACTION_END: Self = Self(0x0004);

    /// The record deletes its stream
    pub const STREAM_DELETE: Self = Self(0x0008);

    /// The prepare is committed by itself and does not wait for a commit record
    pub const IS_COMMITTED: Self = Self(0x0020);

    /// The event data is JSON
    pub const IS_JSON: Self = Self(0x0100);

    /// Flags of a self-committed single event write
    pub const SINGLE_WRITE: Self = Self(0x0001 | 0x0002 | 0x0004 | 0x0020);

    /// Returns `true` if all bits of `other` are set
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits
    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Creates flags from raw bits
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for PrepareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// First phase of a write: carries one event
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrepareLogRecord {
    /// Position of this record in the log
    pub log_position: LogPosition,

    /// Flags
    pub flags: PrepareFlags,

    /// Position of the first prepare of the transaction
    pub transaction_position: LogPosition,

    /// Index of this prepare inside its transaction
    pub transaction_offset: i32,

    /// Version the stream was expected to be at before the write
    pub expected_version: i64,

    /// Stream the event belongs to
    pub event_stream_id: String,

    /// Unique event ID
    pub event_id: u128,

    /// ID correlating the record with the request that created it
    pub correlation_id: u128,

    /// Creation time (milliseconds since epoch)
    pub timestamp: i64,

    /// Event type
    pub event_type: String,

    /// Event payload
    pub data: Slice,

    /// Event metadata
    pub metadata: Slice,
}

impl PrepareLogRecord {
    /// Creates a self-committed prepare for a single event
    #[must_use]
    pub fn single_write<S: Into<String>, T: Into<String>>(
        log_position: LogPosition,
        event_stream_id: S,
        expected_version: i64,
        event_type: T,
        data: &[u8],
        metadata: &[u8],
    ) -> Self {
        Self {
            log_position,
            flags: PrepareFlags::SINGLE_WRITE,
            transaction_position: log_position,
            transaction_offset: 0,
            expected_version,
            event_stream_id: event_stream_id.into(),
            event_id: 0,
            correlation_id: 0,
            timestamp: unix_timestamp_millis(),
            event_type: event_type.into(),
            data: Slice::from(data),
            metadata: Slice::from(metadata),
        }
    }

    /// Returns `true` if the prepare does not need a commit record
    #[must_use]
    pub fn is_self_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    /// Event number of a self-committed prepare
    #[must_use]
    pub fn implicit_event_number(&self) -> i64 {
        self.expected_version + 1 + i64::from(self.transaction_offset)
    }
}

/// Second phase of an explicit transaction: makes its prepares visible
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitLogRecord {
    /// Position of this record in the log
    pub log_position: LogPosition,

    /// Position of the first prepare of the committed transaction
    pub transaction_position: LogPosition,

    /// Event number assigned to the first prepare of the transaction
    pub first_event_number: i64,

    /// ID correlating the record with the request that created it
    pub correlation_id: u128,

    /// Creation time (milliseconds since epoch)
    pub timestamp: i64,
}

impl CommitLogRecord {
    /// Creates a commit record for the transaction starting at `transaction_position`
    #[must_use]
    pub fn new(
        log_position: LogPosition,
        transaction_position: LogPosition,
        first_event_number: i64,
    ) -> Self {
        Self {
            log_position,
            transaction_position,
            first_event_number,
            correlation_id: 0,
            timestamp: unix_timestamp_millis(),
        }
    }
}

/// A record of the transaction log
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    /// Prepare record
    Prepare(PrepareLogRecord),

    /// Commit record
    Commit(CommitLogRecord),
}

enum Tag {
    Prepare = 0,
    Commit = 1,
}

impl TryFrom<u8> for Tag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Prepare),
            1 => Ok(Self::Commit),
            _ => Err(DecodeError::InvalidTag(("LogRecordType", value))),
        }
    }
}

impl From<Tag> for u8 {
    fn from(val: Tag) -> Self {
        val as Self
    }
}

fn write_short_string<W: Write>(writer: &mut W, s: &str) -> std::io::Result<()> {
    // NOTE: Stream IDs and event types are limited to 64 KiB
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u16::<LittleEndian>(s.len() as u16)?;
    writer.write_all(s.as_bytes())
}

fn read_short_string<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    let len = reader.read_u16::<LittleEndian>()?;
    let mut buf = vec![0; len.into()];
    reader.read_exact(&mut buf)?;
    Ok(std::str::from_utf8(&buf)?.to_owned())
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    // NOTE: Payloads are limited by the chunk size, which is an i32
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
    writer.write_all(bytes)
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Slice, DecodeError> {
    let len = reader.read_u32::<LittleEndian>()?;
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(Slice::from(buf))
}

impl LogRecord {
    /// Position of the record in the log
    #[must_use]
    pub fn log_position(&self) -> LogPosition {
        match self {
            Self::Prepare(p) => p.log_position,
            Self::Commit(c) => c.log_position,
        }
    }

    /// Moves the record to another log position
    ///
    /// A prepare that starts its own transaction moves its transaction position along.
    #[must_use]
    pub fn with_log_position(self, position: LogPosition) -> Self {
        match self {
            Self::Prepare(mut p) => {
                if p.transaction_position == p.log_position {
                    p.transaction_position = position;
                }
                p.log_position = position;
                Self::Prepare(p)
            }
            Self::Commit(mut c) => {
                c.log_position = position;
                Self::Commit(c)
            }
        }
    }

    /// Size of the encoded record body (without frame)
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        // type + version + log position
        let common = 1 + 1 + 8;

        match self {
            Self::Prepare(p) => {
                common
                    + 2
                    + 8
                    + 4
                    + 8
                    + 2
                    + p.event_stream_id.len()
                    + 16
                    + 16
                    + 8
                    + 2
                    + p.event_type.len()
                    + 4
                    + p.data.len()
                    + 4
                    + p.metadata.len()
            }
            Self::Commit(_) => common + 8 + 8 + 16 + 8,
        }
    }

    /// Encodes the record body into a writer
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Self::Prepare(p) => {
                writer.write_u8(Tag::Prepare.into())?;
                writer.write_u8(RECORD_VERSION)?;
                writer.write_i64::<LittleEndian>(p.log_position)?;
                writer.write_u16::<LittleEndian>(p.flags.bits())?;
                writer.write_i64::<LittleEndian>(p.transaction_position)?;
                writer.write_i32::<LittleEndian>(p.transaction_offset)?;
                writer.write_i64::<LittleEndian>(p.expected_version)?;
                write_short_string(writer, &p.event_stream_id)?;
                writer.write_u128::<LittleEndian>(p.event_id)?;
                writer.write_u128::<LittleEndian>(p.correlation_id)?;
                writer.write_i64::<LittleEndian>(p.timestamp)?;
                write_short_string(writer, &p.event_type)?;
                write_bytes(writer, &p.data)?;
                write_bytes(writer, &p.metadata)?;
            }
            Self::Commit(c) => {
                writer.write_u8(Tag::Commit.into())?;
                writer.write_u8(RECORD_VERSION)?;
                writer.write_i64::<LittleEndian>(c.log_position)?;
                writer.write_i64::<LittleEndian>(c.transaction_position)?;
                writer.write_i64::<LittleEndian>(c.first_event_number)?;
                writer.write_u128::<LittleEndian>(c.correlation_id)?;
                writer.write_i64::<LittleEndian>(c.timestamp)?;
            }
        }

        Ok(())
    }

    /// Encodes the record body into a new buffer
    #[must_use]
    pub fn encode_into_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());

        // NOTE: Writing into a Vec can't fail
        #[allow(clippy::expect_used)]
        self.encode_into(&mut buf).expect("should encode");

        buf
    }

    /// Decodes a record body
    ///
    /// # Errors
    ///
    /// Will return `Err` if the bytes are not a valid record.
    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = Tag::try_from(reader.read_u8()?)?;

        let version = reader.read_u8()?;
        if version != RECORD_VERSION {
            return Err(DecodeError::InvalidTag(("LogRecordVersion", version)));
        }

        let log_position = reader.read_i64::<LittleEndian>()?;

        match tag {
            Tag::Prepare => {
                let flags = PrepareFlags::from_bits(reader.read_u16::<LittleEndian>()?);
                let transaction_position = reader.read_i64::<LittleEndian>()?;
                let transaction_offset = reader.read_i32::<LittleEndian>()?;
                let expected_version = reader.read_i64::<LittleEndian>()?;
                let event_stream_id = read_short_string(reader)?;
                let event_id = reader.read_u128::<LittleEndian>()?;
                let correlation_id = reader.read_u128::<LittleEndian>()?;
                let timestamp = reader.read_i64::<LittleEndian>()?;
                let event_type = read_short_string(reader)?;
                let data = read_bytes(reader)?;
                let metadata = read_bytes(reader)?;

                Ok(Self::Prepare(PrepareLogRecord {
                    log_position,
                    flags,
                    transaction_position,
                    transaction_offset,
                    expected_version,
                    event_stream_id,
                    event_id,
                    correlation_id,
                    timestamp,
                    event_type,
                    data,
                    metadata,
                }))
            }
            Tag::Commit => {
                let transaction_position = reader.read_i64::<LittleEndian>()?;
                let first_event_number = reader.read_i64::<LittleEndian>()?;
                let correlation_id = reader.read_u128::<LittleEndian>()?;
                let timestamp = reader.read_i64::<LittleEndian>()?;

                Ok(Self::Commit(CommitLogRecord {
                    log_position,
                    transaction_position,
                    first_event_number,
                    correlation_id,
                    timestamp,
                }))
            }
        }
    }
}

fn unix_timestamp_millis() -> i64 {
    let now = std::time::SystemTime::now();

    // NOTE: Millis since epoch fit into an i64 for the next few million years
    #[allow(clippy::cast_possible_truncation)]
    now.duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
