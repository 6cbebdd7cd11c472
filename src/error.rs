// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::PathBuf;

/// Error during decoding of an on-disk structure
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Invalid enum tag
    InvalidTag((&'static str, u8)),

    /// Invalid UTF-8 in a string field
    Utf8(std::str::Utf8Error),

    /// The body of a record could not be decompressed
    Decompress(String),

    /// A record frame is damaged (length prefix and suffix disagree, or the length is out of bounds)
    InvalidFrame {
        /// Log position of the frame
        position: i64,

        /// Length stored in front of the record body
        length: u32,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({self:?})")
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

/// The stream index is damaged and needs to be rebuilt
#[derive(Debug)]
pub enum CorruptIndexError {
    /// A table file has an unrecognized header
    InvalidFile(InvalidFileError),

    /// The stored MD5 hash of a file does not match its content
    HashValidation {
        /// File that failed validation
        path: PathBuf,
    },

    /// A lookup found entries that break the sort order of a table
    MaybeCorrupt {
        /// Table file
        path: PathBuf,

        /// Description of the violation
        reason: String,
    },

    /// The index map manifest could not be parsed
    Manifest {
        /// Manifest file
        path: PathBuf,

        /// Description of the problem
        reason: String,
    },

    /// The index map references a table file that does not exist
    MissingTable(PathBuf),
}

/// A file does not start with a recognized file type marker
#[derive(Debug)]
pub struct InvalidFileError {
    /// Offending file
    pub path: PathBuf,

    /// Description of the problem
    pub reason: String,
}

/// Represents errors that can occur in the event log and its index
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Decoding failed
    Decode(DecodeError),

    /// Index corruption
    CorruptIndex(CorruptIndexError),

    /// A log file has an unrecognized header
    InvalidFile(InvalidFileError),

    /// The stored MD5 hash of a chunk does not match its content
    HashValidation(PathBuf),

    /// A chunk file does not fit into the database (wrong number, size, or truncated data)
    BadChunkInDatabase {
        /// Offending chunk file
        path: PathBuf,

        /// Description of the problem
        reason: String,
    },

    /// The file has a known, but wrong format version
    WrongFileVersion {
        /// Offending file
        path: PathBuf,

        /// Version the reader expected
        expected: u8,

        /// Version found in the file
        actual: u8,
    },

    /// The file has a format version this build does not know
    UnsupportedFileVersion {
        /// Offending file
        path: PathBuf,

        /// Version found in the file
        version: u8,
    },

    /// No chunk covers the given log position (or chunk number)
    ChunkNotFound(i64),

    /// The chunk is being replaced and will be deleted, retry with a fresh chunk
    FileBeingDeleted,

    /// A reader checkpoint is ahead of the writer checkpoint
    ReaderCheckpointHigherThanWriter {
        /// Name of the reader checkpoint
        checkpoint: &'static str,

        /// Value of the reader checkpoint
        reader: i64,

        /// Value of the writer checkpoint
        writer: i64,
    },

    /// The record does not fit into an empty chunk
    RecordTooLarge {
        /// Serialized size of the record
        size: usize,

        /// Maximum size that fits into one chunk
        max: usize,
    },

    /// The target chunk was scavenged and the caller did not allow reading scavenged chunks
    ChunkScavenged(i64),

    /// The chunk uses a transform this build can not apply
    UnsupportedTransform(u8),

    /// The operation was cancelled through its stop signal
    Cancelled,

    /// A background worker failed, the index is not usable anymore
    Poisoned,

    /// No reader was returned to the pool in time
    ReaderPoolExhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkStoreError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
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

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<CorruptIndexError> for Error {
    fn from(value: CorruptIndexError) -> Self {
        Self::CorruptIndex(value)
    }
}

/// Result helper type
pub type Result<T> = std::result::Result<T, Error>;
