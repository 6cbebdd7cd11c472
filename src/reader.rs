// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    chunk::{Chunk, ChunkRecord},
    chunk_db::ChunkDb,
    record::{LogPosition, LogRecord},
};
use std::sync::Arc;

/// A record read from the log, with global positions
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadResult {
    /// The record
    pub record: LogRecord,

    /// Position of the record
    pub log_position: LogPosition,

    /// Position directly after the record
    pub post_position: LogPosition,
}

impl ReadResult {
    fn from_chunk_record(chunk: &Chunk, record: ChunkRecord) -> Self {
        let start = chunk.header().chunk_start_position();

        Self {
            log_position: start + record.offset,
            post_position: start + record.next_offset(),
            record: record.record,
        }
    }
}

/// Runs `f` against the chunk containing `position`
///
/// If the chunk is being replaced, the chunk is looked up again and `f` is retried once.
fn with_chunk<T, F: Fn(&Chunk, i64) -> crate::Result<T>>(
    db: &ChunkDb,
    position: LogPosition,
    f: F,
) -> crate::Result<(Arc<Chunk>, T)> {
    let chunk = db.get_chunk_for(position)?;
    let local = position - chunk.header().chunk_start_position();

    match f(&chunk, local) {
        Err(crate::Error::FileBeingDeleted) => {
            log::trace!("Chunk for {position} is being replaced, retrying");

            let chunk = db.get_chunk_for(position)?;
            let local = position - chunk.header().chunk_start_position();
            let result = f(&chunk, local)?;
            Ok((chunk, result))
        }
        other => other.map(|result| (chunk, result)),
    }
}

/// A seekable cursor over the transaction log
///
/// Reads never go past the flushed writer checkpoint.
pub struct TransactionFileReader {
    db: Arc<ChunkDb>,
    position: LogPosition,
}

impl TransactionFileReader {
    /// Creates a reader at the given position
    #[must_use]
    pub fn new(db: Arc<ChunkDb>, position: LogPosition) -> Self {
        Self { db, position }
    }

    /// Current position of the cursor
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Moves the cursor
    pub fn reposition(&mut self, position: LogPosition) {
        self.position = position;
    }

    fn limit(&self) -> LogPosition {
        self.db.checkpoints().writer.read()
    }

    /// Reads the record at or after the cursor and moves the cursor behind it
    ///
    /// Returns `None` if there is no durable record after the cursor.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a record is damaged.
    pub fn try_read_next(&mut self) -> crate::Result<Option<ReadResult>> {
        let limit = self.limit();

        loop {
            if self.position >= limit {
                return Ok(None);
            }

            let (chunk, record) = with_chunk(&self.db, self.position, |chunk, local| {
                chunk.try_read_closest_forward(local)
            })?;

            match record {
                Some(record) => {
                    let result = ReadResult::from_chunk_record(&chunk, record);

                    if result.post_position > limit {
                        return Ok(None);
                    }

                    self.position = result.post_position;
                    return Ok(Some(result));
                }
                None if chunk.is_completed() => {
                    let chunk_end = chunk.header().chunk_end_position();

                    // NOTE: The writer checkpoint moves past a completed chunk only after completing it
                    if chunk_end > limit {
                        return Ok(None);
                    }

                    // Skip padding and removed records at the end of the chunk
                    self.position = chunk_end;
                }
                None => return Ok(None),
            }
        }
    }

    /// Reads the record before the cursor and moves the cursor onto it
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a record is damaged.
    pub fn try_read_prev(&mut self) -> crate::Result<Option<ReadResult>> {
        self.position = self.position.min(self.limit());

        loop {
            if self.position <= 0 {
                return Ok(None);
            }

            let (chunk, record) = with_chunk(&self.db, self.position - 1, |chunk, local| {
                chunk.try_read_closest_backward(local + 1)
            })?;

            match record {
                Some(record) => {
                    let result = ReadResult::from_chunk_record(&chunk, record);
                    self.position = result.log_position;
                    return Ok(Some(result));
                }
                None => {
                    self.position = chunk.header().chunk_start_position();
                }
            }
        }
    }

    /// Reads the record starting exactly at `position`, without moving the cursor
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChunkScavenged`] if the chunk was scavenged and `allow_scavenged` is not set.
    pub fn try_read_at(
        &self,
        position: LogPosition,
        allow_scavenged: bool,
    ) -> crate::Result<Option<ReadResult>> {
        if position < 0 || position >= self.limit() {
            return Ok(None);
        }

        let (chunk, record) = with_chunk(&self.db, position, |chunk, local| {
            chunk.try_read_at(local, allow_scavenged)
        })?;

        Ok(record.map(|record| ReadResult::from_chunk_record(&chunk, record)))
    }

    /// Returns `true` if `position` lies inside the durable part of the log
    #[must_use]
    pub fn exists_at(&self, position: LogPosition) -> bool {
        position >= 0 && position < self.limit() && self.db.get_chunk_for(position).is_ok()
    }
}

/// Result of a bulk read
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BulkReadResult {
    /// Offset the read started at
    pub old_position: u64,

    /// Amount of bytes read
    pub bytes_read: usize,

    /// `true` if there is nothing more to read
    pub is_eof: bool,
}

/// Reads bytes of a single chunk, independent of record boundaries
pub struct BulkReader {
    chunk: Arc<Chunk>,
    position: u64,
    is_raw: bool,
}

impl BulkReader {
    /// Reads the whole chunk file, starting at `file_offset`
    #[must_use]
    pub fn raw(chunk: Arc<Chunk>, file_offset: u64) -> Self {
        Self {
            chunk,
            position: file_offset,
            is_raw: true,
        }
    }

    /// Reads the data region of the chunk, starting at `data_offset`
    #[must_use]
    pub fn data(chunk: Arc<Chunk>, data_offset: u64) -> Self {
        Self {
            chunk,
            position: data_offset,
            is_raw: false,
        }
    }

    /// The chunk that is read
    #[must_use]
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Current offset
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next bytes into `buf`
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn read(&mut self, buf: &mut [u8]) -> crate::Result<BulkReadResult> {
        let old_position = self.position;

        let (bytes_read, end) = if self.is_raw {
            let bytes_read = self.chunk.read_raw(self.position, buf)?;
            (bytes_read, self.chunk.file_size()?)
        } else {
            let bytes_read = self.chunk.read_data(self.position as i64, buf)?;
            (bytes_read, self.chunk.physical_data_size() as u64)
        };

        self.position += bytes_read as u64;

        // NOTE: The data of an active chunk can still grow
        let is_eof = self.position >= end && (self.is_raw || self.chunk.is_completed());

        Ok(BulkReadResult {
            old_position,
            bytes_read,
            is_eof,
        })
    }
}
