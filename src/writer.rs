// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    chunk::{AppendResult, Chunk},
    chunk_db::ChunkDb,
    record::{LogPosition, LogRecord, FRAME_OVERHEAD},
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Outcome of [`TransactionFileWriter::try_write`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteResult {
    /// The record was appended
    Written {
        /// Position of the record
        log_position: LogPosition,

        /// Position directly after the record
        post_position: LogPosition,
    },

    /// The record was not written, it needs to be moved to `new_position` and written again
    Retry {
        /// Current writer position
        new_position: LogPosition,
    },
}

/// The only appender of the transaction log
///
/// Appends move the writer checkpoint in memory, [`TransactionFileWriter::flush`] makes them durable.
pub struct TransactionFileWriter {
    db: Arc<ChunkDb>,
    chunk: Arc<Chunk>,
    position: LogPosition,
    min_flush_delay: Duration,
    last_flush: Instant,
}

impl TransactionFileWriter {
    /// Opens the writer at the writer checkpoint
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChunkNotFound`] if there is no active chunk.
    pub fn open(db: Arc<ChunkDb>) -> crate::Result<Self> {
        let position = db.checkpoints().writer.read();
        let chunk = db.get_chunk_for(position)?;

        log::debug!("Opening writer at {position}");

        Ok(Self {
            min_flush_delay: db.config().min_flush_delay,
            db,
            chunk,
            position,
            last_flush: Instant::now(),
        })
    }

    /// Position the next record is written at
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Tries to append a record
    ///
    /// If the record's position does not match the writer position, or the active chunk
    /// is full, the record is not written and [`WriteResult::Retry`] is returned.
    /// A full chunk is completed and a new chunk is started before returning.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::RecordTooLarge`] if the record does not fit into an empty chunk.
    pub fn try_write(&mut self, record: &LogRecord) -> crate::Result<WriteResult> {
        if record.log_position() != self.position {
            log::trace!(
                "Record at {} does not match writer position {}",
                record.log_position(),
                self.position
            );

            return Ok(WriteResult::Retry {
                new_position: self.position,
            });
        }

        let chunk_start = self.chunk.header().chunk_start_position();

        match self.chunk.try_append(record)? {
            AppendResult::Written { offset, next } => {
                self.position = chunk_start + next;
                self.db.checkpoints().writer.write(self.position);

                Ok(WriteResult::Written {
                    log_position: chunk_start + offset,
                    post_position: self.position,
                })
            }
            AppendResult::ChunkFull => {
                if self.position == chunk_start {
                    return Err(crate::Error::RecordTooLarge {
                        size: record.encoded_size() + FRAME_OVERHEAD,
                        max: self.db.chunk_size() as usize,
                    });
                }

                self.complete_chunk()?;

                Ok(WriteResult::Retry {
                    new_position: self.position,
                })
            }
        }
    }

    /// Appends a record, moving it to the writer position or the next chunk if needed
    ///
    /// Returns the position of the record and the position after it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::RecordTooLarge`] if the record does not fit into an empty chunk.
    pub fn write(&mut self, mut record: LogRecord) -> crate::Result<(LogPosition, LogPosition)> {
        // NOTE: Terminates, a record that does not fit into a fresh chunk fails in `try_write`
        loop {
            match self.try_write(&record)? {
                WriteResult::Written {
                    log_position,
                    post_position,
                } => return Ok((log_position, post_position)),
                WriteResult::Retry { new_position } => {
                    record = record.with_log_position(new_position);
                }
            }
        }
    }

    /// Completes the active chunk and starts the next one
    fn complete_chunk(&mut self) -> crate::Result<()> {
        log::debug!(
            "Completing chunk {} at {}",
            self.chunk.header().chunk_start_number,
            self.position
        );

        // NOTE: Completing writes all buffered data and syncs the file
        self.chunk.complete(&[], None)?;

        self.chunk = self.db.manager().add_new_chunk()?;
        self.position = self.chunk.header().chunk_start_position();

        let checkpoint = &self.db.checkpoints().writer;
        checkpoint.write(self.position);
        checkpoint.flush()?;
        self.last_flush = Instant::now();

        Ok(())
    }

    /// Returns `true` if records were written after the last flush
    #[must_use]
    pub fn has_unflushed(&self) -> bool {
        self.db.checkpoints().writer.read() < self.position
    }

    /// Flushes if records are pending and the minimum flush delay has passed
    ///
    /// Returns `true` if a flush happened.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush_if_due(&mut self) -> crate::Result<bool> {
        if !self.has_unflushed() || self.last_flush.elapsed() < self.min_flush_delay {
            return Ok(false);
        }

        self.flush(true)
    }

    /// Makes written records durable and flushes the writer checkpoint
    ///
    /// Unless `force` is set, nothing happens if the last flush was less than
    /// the configured minimum flush delay ago.
    ///
    /// Returns `true` if a flush happened.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&mut self, force: bool) -> crate::Result<bool> {
        if !force && self.last_flush.elapsed() < self.min_flush_delay {
            return Ok(false);
        }

        // IMPORTANT: Data needs to be durable before the checkpoint claims it
        self.chunk.flush()?;

        let checkpoint = &self.db.checkpoints().writer;
        checkpoint.write(self.position);
        checkpoint.flush()?;

        self.last_flush = Instant::now();

        Ok(true)
    }
}

impl Drop for TransactionFileWriter {
    fn drop(&mut self) {
        log::trace!("Dropping writer at {}", self.position);

        if let Err(e) = self.flush(true) {
            log::error!("Failed to flush writer on drop: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::PrepareLogRecord, Config};
    use test_log::test;

    fn prepare(position: LogPosition, data: &[u8]) -> LogRecord {
        LogRecord::Prepare(PrepareLogRecord::single_write(
            position, "stream", -1, "type", data, b"",
        ))
    }

    fn open(folder: &std::path::Path) -> crate::Result<Arc<ChunkDb>> {
        Ok(Arc::new(ChunkDb::open(
            Config::new(folder).chunk_size(1_024).alignment_size(1),
        )?))
    }

    #[test]
    fn writer_write_and_flush() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;
        let mut writer = TransactionFileWriter::open(db.clone())?;

        let (pos, post) = writer.write(prepare(0, b"a"))?;
        assert_eq!(0, pos);
        assert_eq!(post, writer.position());

        assert_eq!(0, db.checkpoints().writer.read());
        assert_eq!(post, db.checkpoints().writer.read_non_flushed());

        assert!(writer.flush(true)?);
        assert_eq!(post, db.checkpoints().writer.read());

        Ok(())
    }

    #[test]
    fn writer_retry_on_wrong_position() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;
        let mut writer = TransactionFileWriter::open(db)?;

        assert_eq!(
            WriteResult::Retry { new_position: 0 },
            writer.try_write(&prepare(77, b"a"))?
        );

        // `write` moves the record
        let (pos, _) = writer.write(prepare(77, b"a"))?;
        assert_eq!(0, pos);

        Ok(())
    }

    #[test]
    fn writer_rolls_chunk() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;
        let mut writer = TransactionFileWriter::open(db.clone())?;

        let mut positions = vec![];
        for _ in 0..20 {
            let (pos, _) = writer.write(prepare(writer.position(), &[0; 100]))?;
            positions.push(pos);
        }

        assert!(db.manager().chunk_count() > 1);
        assert!(db.get_chunk_for(0)?.is_completed());
        assert!(positions.contains(&1_024));

        // The checkpoint was moved to the start of the new chunk when rolling
        assert!(db.checkpoints().writer.read() >= 1_024);

        Ok(())
    }

    #[test]
    fn writer_stale_record_into_full_chunk() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;
        let mut writer = TransactionFileWriter::open(db.clone())?;

        let (pos, post) = writer.write(prepare(0, &[0; 100]))?;
        let frame_size = post - pos;

        while writer.position() + frame_size <= 1_024 {
            writer.write(prepare(writer.position(), &[0; 100]))?;
        }
        assert_eq!(1, db.manager().chunk_count());

        // Built at a stale position, and the active chunk has no room left
        let (pos, post) = writer.write(prepare(0, &[0; 100]))?;
        assert_eq!(1_024, pos);
        assert_eq!(1_024 + frame_size, post);
        assert_eq!(2, db.manager().chunk_count());
        assert!(db.get_chunk_for(0)?.is_completed());

        Ok(())
    }

    #[test]
    fn writer_record_too_large() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;
        let mut writer = TransactionFileWriter::open(db.clone())?;

        assert!(matches!(
            writer.write(prepare(0, &[0; 2_000])),
            Err(crate::Error::RecordTooLarge { max: 1_024, .. })
        ));

        // Nothing was written
        assert_eq!(0, writer.position());
        assert_eq!(1, db.manager().chunk_count());

        Ok(())
    }

    #[test]
    fn writer_flush_if_due() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(
            Config::new(folder.path())
                .chunk_size(1_024)
                .min_flush_delay(Duration::from_millis(20)),
        )?);
        let mut writer = TransactionFileWriter::open(db)?;
        assert!(!writer.has_unflushed());

        writer.write(prepare(0, b"a"))?;
        assert!(writer.has_unflushed());

        std::thread::sleep(Duration::from_millis(30));
        assert!(writer.flush_if_due()?);
        assert!(!writer.has_unflushed());

        // Nothing pending
        std::thread::sleep(Duration::from_millis(30));
        assert!(!writer.flush_if_due()?);

        Ok(())
    }

    #[test]
    fn writer_min_flush_delay() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(
            Config::new(folder.path())
                .chunk_size(1_024)
                .min_flush_delay(Duration::from_secs(60)),
        )?);
        let mut writer = TransactionFileWriter::open(db)?;

        writer.write(prepare(0, b"a"))?;
        assert!(!writer.flush(false)?);
        assert!(writer.flush(true)?);

        Ok(())
    }
}
