// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::entry::{IndexEntry, IndexKey};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// The memtable collects new index entries until it is flushed to a table
///
/// Entries are kept in table order, so flushing is a plain iteration.
pub struct MemTable {
    pub(crate) items: SkipMap<IndexKey, i64>,

    /// Prepare position up to which the log is indexed in this memtable
    prepare_checkpoint: AtomicI64,

    /// Commit position up to which the log is indexed in this memtable
    commit_checkpoint: AtomicI64,
}

impl Default for MemTable {
    fn default() -> Self {
        Self {
            items: SkipMap::default(),
            prepare_checkpoint: AtomicI64::new(-1),
            commit_checkpoint: AtomicI64::new(-1),
        }
    }
}

impl MemTable {
    /// Inserts an entry
    ///
    /// Published entries are never replaced: if the key exists, the first position is kept.
    /// The same key only shows up twice if two streams share a hash and an event number.
    pub fn insert(&self, entry: IndexEntry) {
        self.items.get_or_insert(entry.key(), entry.position);
    }

    /// Moves the checkpoints forward
    pub fn set_checkpoints(&self, prepare: i64, commit: i64) {
        self.prepare_checkpoint.fetch_max(prepare, Ordering::AcqRel);
        self.commit_checkpoint.fetch_max(commit, Ordering::AcqRel);
    }

    /// Prepare checkpoint of the newest entries
    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint.load(Ordering::Acquire)
    }

    /// Commit checkpoint of the newest entries
    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint.load(Ordering::Acquire)
    }

    /// Returns the log position of the given event
    pub fn get(&self, stream: u64, version: i64) -> Option<i64> {
        self.items
            .get(&IndexKey::new(stream, version))
            .map(|entry| *entry.value())
    }

    /// Returns the entry with the highest event number of the stream
    pub fn latest(&self, stream: u64) -> Option<IndexEntry> {
        self.items
            .range(IndexKey::first_of(stream)..=IndexKey::last_of(stream))
            .next()
            .map(|entry| to_entry(entry.key(), *entry.value()))
    }

    /// Returns the entry with the lowest event number of the stream
    pub fn oldest(&self, stream: u64) -> Option<IndexEntry> {
        self.items
            .range(IndexKey::first_of(stream)..=IndexKey::last_of(stream))
            .next_back()
            .map(|entry| to_entry(entry.key(), *entry.value()))
    }

    /// Returns the entries of the stream with `from <= version <= to`,
    /// highest event number first
    pub fn range(&self, stream: u64, from: i64, to: i64) -> impl Iterator<Item = IndexEntry> + '_ {
        let bounds = if from <= to {
            Some(IndexKey::new(stream, to)..=IndexKey::new(stream, from))
        } else {
            None
        };

        bounds
            .into_iter()
            .flat_map(|bounds| self.items.range(bounds))
            .map(|entry| to_entry(entry.key(), *entry.value()))
    }

    /// Iterates over all entries in table order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = IndexEntry> + '_ {
        self.items
            .iter()
            .map(|entry| to_entry(entry.key(), *entry.value()))
    }

    /// Count the amount of entries in the memtable
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the memtable is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn to_entry(key: &IndexKey, position: i64) -> IndexEntry {
    IndexEntry::new(key.stream, key.version, position)
}
