// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checkpoint::CheckpointHandle,
    reader::ReadResult,
    reader_pool::ReaderLease,
    record::LogPosition,
};

/// Follows the writer, surfacing records once they are durable
///
/// The chaser checkpoint is moved after every read, so a restarted
/// chaser resumes where it left off.
pub struct TransactionFileChaser {
    reader: ReaderLease,
    checkpoint: CheckpointHandle,
}

impl TransactionFileChaser {
    /// Creates a chaser starting at the chaser checkpoint
    #[must_use]
    pub fn new(mut reader: ReaderLease, checkpoint: CheckpointHandle) -> Self {
        let position = checkpoint.read();
        log::debug!("Opening chaser at {position}");

        reader.reposition(position);

        Self { reader, checkpoint }
    }

    /// Current position of the chaser
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.reader.position()
    }

    /// Reads the next durable record
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a record is damaged.
    pub fn try_read_next(&mut self) -> crate::Result<Option<ReadResult>> {
        let result = self.reader.try_read_next()?;

        match &result {
            Some(result) => self.checkpoint.write(result.post_position),
            None => self.checkpoint.write(self.reader.position()),
        }

        Ok(result)
    }

    /// Persists the chaser checkpoint
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&self) -> crate::Result<()> {
        self.checkpoint.flush()
    }
}
