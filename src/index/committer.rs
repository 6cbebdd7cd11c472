// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{entry::IndexEntry, hash::stream_hash, TableIndex};
use crate::record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};
use std::collections::HashMap;
use xxhash_rust::xxh3::Xxh3Builder;

/// Turns log records into index entries
///
/// Self-committed prepares are indexed right away. Prepares of explicit transactions
/// are held back until their commit record arrives, which assigns their event numbers.
#[derive(Default)]
pub struct IndexCommitter {
    /// Data prepares of open transactions, by transaction position
    pending: HashMap<i64, Vec<PrepareLogRecord>, Xxh3Builder>,
}

impl IndexCommitter {
    /// Creates a committer without open transactions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log position replay needs to start from, so every record that is
    /// not in the index tables is seen again
    #[must_use]
    pub fn replay_start(prepare_checkpoint: i64, commit_checkpoint: i64) -> i64 {
        prepare_checkpoint.min(commit_checkpoint).max(0)
    }

    /// Amount of transactions that have not seen their commit record yet
    #[must_use]
    pub fn pending_transactions(&self) -> usize {
        self.pending.len()
    }

    fn prepare_checkpoint(&self, current: i64) -> i64 {
        self.pending.keys().copied().min().unwrap_or(current).min(current)
    }

    fn index_prepare(&mut self, prepare: &PrepareLogRecord, index: &TableIndex) -> crate::Result<()> {
        let position = prepare.log_position;

        if prepare.is_self_committed() {
            let entries = if prepare.flags.contains(PrepareFlags::DATA) {
                vec![IndexEntry::new(
                    stream_hash(&prepare.event_stream_id),
                    prepare.implicit_event_number(),
                    position,
                )]
            } else {
                vec![]
            };

            return index.add_entries(self.prepare_checkpoint(position), position, &entries);
        }

        let prepares = self.pending.entry(prepare.transaction_position).or_default();
        if prepare.flags.contains(PrepareFlags::DATA) {
            prepares.push(prepare.clone());
        }

        index.add_entries(self.prepare_checkpoint(position), position, &[])
    }

    fn index_commit(&mut self, commit: &CommitLogRecord, index: &TableIndex) -> crate::Result<()> {
        let position = commit.log_position;

        let entries = match self.pending.remove(&commit.transaction_position) {
            Some(prepares) => (0i64..)
                .zip(&prepares)
                .map(|(offset, prepare)| {
                    IndexEntry::new(
                        stream_hash(&prepare.event_stream_id),
                        commit.first_event_number + offset,
                        prepare.log_position,
                    )
                })
                .collect::<Vec<_>>(),
            None => {
                log::warn!(
                    "Commit at {position} references unknown transaction at {}",
                    commit.transaction_position
                );
                vec![]
            }
        };

        index.add_entries(self.prepare_checkpoint(position), position, &entries)
    }

    /// Feeds the next log record to the index
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index is poisoned.
    pub fn commit(&mut self, record: &LogRecord, index: &TableIndex) -> crate::Result<()> {
        match record {
            LogRecord::Prepare(prepare) => self.index_prepare(prepare, index),
            LogRecord::Commit(commit) => self.index_commit(commit, index),
        }
    }
}
