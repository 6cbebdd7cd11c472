// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod committer;
pub mod entry;
pub mod hash;
pub mod map;
pub mod memtable;
pub mod merge;
pub mod midpoint;
pub mod ptable;

use crate::{
    background_worker::{Activity, BackgroundWorker},
    checkpoint::CheckpointHandle,
    file::{INDEX_MAP_FILE, PTABLE_FILE_EXT},
    poison_dart::PoisonDart,
    stop_signal::StopSignal,
    Config,
};
use entry::IndexEntry;
use map::IndexMap;
use memtable::MemTable;
use merge::{BoxedIterator, MergeIterator};
use ptable::{parse_table_id, table_file_name, PTable};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use std_semaphore::Semaphore;

/// Tuning of the stream index
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct IndexConfig {
    /// Entries after which the active memtable is sealed and flushed
    pub max_memtable_entries: usize,

    /// Tables a level may hold before it is merged into the next level
    pub max_tables_per_level: usize,

    /// Levels at or above this are only merged manually
    pub max_auto_merge_level: u32,

    /// Midpoints cached per table are `2^cache_depth` at most
    pub cache_depth: u32,

    /// Verify table hashes on open
    pub verify_hashes: bool,

    /// File handles per table
    pub descriptor_count: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_memtable_entries: 1_000_000,
            max_tables_per_level: 4,
            max_auto_merge_level: u32::MAX,
            cache_depth: 16,
            verify_hashes: true,
            descriptor_count: 2,
        }
    }
}

impl From<&Config> for IndexConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_memtable_entries: config.max_memtable_entries,
            max_tables_per_level: config.max_tables_per_level,
            max_auto_merge_level: config.max_auto_merge_level,
            cache_depth: config.index_cache_depth,
            verify_hashes: config.verify_index_hashes,
            descriptor_count: config.descriptor_count,
        }
    }
}

/// Point-in-time view of the index
///
/// Readers clone the snapshot out of the lock and search it without blocking writers.
#[derive(Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct IndexSnapshot {
    active: Arc<MemTable>,

    /// Sealed memtables waiting for flush, newest first
    sealed: Vec<Arc<MemTable>>,

    map: IndexMap,
}

impl IndexSnapshot {
    /// The current table map
    #[must_use]
    pub fn map(&self) -> &IndexMap {
        &self.map
    }

    /// Amount of entries in the active memtable
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Amount of memtables waiting for flush
    #[must_use]
    pub fn sealed_count(&self) -> usize {
        self.sealed.len()
    }

    fn memtables(&self) -> impl Iterator<Item = &Arc<MemTable>> {
        std::iter::once(&self.active).chain(self.sealed.iter())
    }
}

pub struct TableIndexInner {
    folder: PathBuf,
    config: IndexConfig,

    snapshot: RwLock<Arc<IndexSnapshot>>,

    /// Serializes snapshot swaps
    swap_lock: Mutex<()>,

    /// Serializes table map changes (flushes and merges) for their whole duration
    map_lock: Mutex<()>,

    next_table_id: AtomicU64,

    /// Wakes up the index worker
    semaphore: Semaphore,

    stop_signal: StopSignal,
    is_poisoned: Arc<AtomicBool>,

    /// Durable index position, updated after every manifest save
    checkpoint: Option<CheckpointHandle>,

    active_background_threads: Arc<AtomicUsize>,
}

/// Stream index: memtables in front of a levelled set of immutable tables
///
/// Entries are added by a single indexing thread. Sealed memtables are flushed
/// and full levels are merged by a background worker.
#[allow(clippy::module_name_repetitions)]
pub struct TableIndex(Arc<TableIndexInner>);

impl std::ops::Deref for TableIndex {
    type Target = TableIndexInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for TableIndex {
    fn drop(&mut self) {
        log::trace!("Dropping table index, waiting for background worker");
        self.shutdown();
    }
}

/// Removes table files the map does not reference and temporary files
fn remove_orphans(folder: &Path, map: &IndexMap) -> crate::Result<u64> {
    let mut max_id = map.in_order().map(|table| table.id()).max().unwrap_or(0);

    for dirent in std::fs::read_dir(folder)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        if file_name == INDEX_MAP_FILE {
            continue;
        }

        let is_referenced = parse_table_id(file_name).is_some_and(|id| {
            max_id = max_id.max(id);
            map.in_order().any(|table| table.id() == id)
        });

        let is_orphan = (file_name.ends_with(PTABLE_FILE_EXT) && !is_referenced)
            || file_name.starts_with(".tmp");

        if is_orphan {
            log::debug!("Removing orphaned index file {file_name:?}");
            std::fs::remove_file(dirent.path())?;
        }
    }

    Ok(max_id)
}

impl TableIndex {
    /// Opens the index in `folder`, loading the table map and starting the index worker
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorruptIndex`] if the table map or a table is damaged.
    pub fn open<P: AsRef<Path>>(
        folder: P,
        config: IndexConfig,
        checkpoint: Option<CheckpointHandle>,
    ) -> crate::Result<Self> {
        let folder = folder.as_ref();
        log::debug!("Opening table index at {folder:?}");

        std::fs::create_dir_all(folder)?;

        let map = IndexMap::from_file(folder.join(INDEX_MAP_FILE), folder, &config)?;
        let max_id = remove_orphans(folder, &map)?;

        let inner = TableIndexInner {
            folder: folder.to_path_buf(),
            config,
            snapshot: RwLock::new(Arc::new(IndexSnapshot {
                active: Arc::default(),
                sealed: vec![],
                map,
            })),
            swap_lock: Mutex::default(),
            map_lock: Mutex::default(),
            next_table_id: AtomicU64::new(max_id + 1),
            semaphore: Semaphore::new(0),
            stop_signal: StopSignal::default(),
            is_poisoned: Arc::default(),
            checkpoint,
            active_background_threads: Arc::default(),
        };

        let index = Self(Arc::new(inner));

        BackgroundWorker::new(
            IndexWorker(index.0.clone()),
            PoisonDart::new("index worker", index.is_poisoned.clone()),
            index.active_background_threads.clone(),
            index.stop_signal.clone(),
        )
        .spawn()?;

        // NOTE: A map that needs merging (e.g. after lowering the max auto-merge level)
        // is picked up right away
        index.semaphore.release();

        Ok(index)
    }

    /// Stops the index worker and waits for it to exit
    ///
    /// Lookups keep working afterwards, but nothing is flushed or merged anymore.
    pub fn shutdown(&self) {
        self.stop_signal.send();

        while self.active_background_threads.load(Ordering::Acquire) > 0 {
            // NOTE: Trick the worker into waking up
            self.semaphore.release();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Returns the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.0.current()
    }

    /// Returns `true` if the index worker failed
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.is_poisoned.load(Ordering::Acquire)
    }

    /// Prepare and commit positions up to which the log is indexed in tables
    #[must_use]
    pub fn table_checkpoints(&self) -> (i64, i64) {
        let snapshot = self.snapshot();
        (
            snapshot.map.prepare_checkpoint(),
            snapshot.map.commit_checkpoint(),
        )
    }

    /// Adds entries to the active memtable and moves its checkpoints forward
    ///
    /// Seals the memtable once it is full.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Poisoned`] if the index worker failed.
    pub fn add_entries(
        &self,
        prepare_checkpoint: i64,
        commit_checkpoint: i64,
        entries: &[IndexEntry],
    ) -> crate::Result<()> {
        if self.is_poisoned() {
            return Err(crate::Error::Poisoned);
        }

        // NOTE: Holding the swap lock keeps the active memtable from being sealed mid-batch
        #[allow(clippy::expect_used)]
        let _lock = self.swap_lock.lock().expect("lock is poisoned");

        let snapshot = self.snapshot();

        for entry in entries {
            snapshot.active.insert(*entry);
        }
        snapshot
            .active
            .set_checkpoints(prepare_checkpoint, commit_checkpoint);

        if snapshot.active.len() >= self.config.max_memtable_entries {
            self.seal_locked();
        }

        Ok(())
    }

    /// Seals the active memtable (if it has entries) and wakes up the index worker
    ///
    /// May be called from any thread, entries that are being added concurrently
    /// end up either in the sealed memtable or in the new active one.
    pub fn seal_active_memtable(&self) {
        #[allow(clippy::expect_used)]
        let _lock = self.swap_lock.lock().expect("lock is poisoned");

        self.seal_locked();
    }

    /// Caller must hold the swap lock
    fn seal_locked(&self) {
        let current = self.snapshot();
        if current.active.is_empty() {
            return;
        }

        log::trace!("Sealing memtable with {} entries", current.active.len());

        let mut sealed = Vec::with_capacity(current.sealed.len() + 1);
        sealed.push(current.active.clone());
        sealed.extend(current.sealed.iter().cloned());

        self.swap(IndexSnapshot {
            active: Arc::default(),
            sealed,
            map: current.map.clone(),
        });

        self.semaphore.release();
    }

    /// Returns the log position of the given event
    ///
    /// Memtables are searched first, then tables newest to oldest.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a table is corrupt.
    pub fn get(&self, stream: u64, version: i64) -> crate::Result<Option<i64>> {
        let snapshot = self.snapshot();

        for memtable in snapshot.memtables() {
            if let Some(position) = memtable.get(stream, version) {
                return Ok(Some(position));
            }
        }

        for table in snapshot.map.in_order() {
            if let Some(position) = table.get(stream, version)? {
                return Ok(Some(position));
            }
        }

        Ok(None)
    }

    fn pick_entry<F: FnMut(&MemTable) -> Option<IndexEntry>>(
        &self,
        stream: u64,
        mut from_memtable: F,
        is_better: fn(i64, i64) -> bool,
        latest: bool,
    ) -> crate::Result<Option<IndexEntry>> {
        let snapshot = self.snapshot();
        let mut best: Option<IndexEntry> = None;

        let mut consider = |candidate: Option<IndexEntry>| {
            if let Some(candidate) = candidate {
                // NOTE: Ties keep the entry of the newer source
                if best.map_or(true, |best| is_better(candidate.version, best.version)) {
                    best = Some(candidate);
                }
            }
        };

        for memtable in snapshot.memtables() {
            consider(from_memtable(memtable));
        }

        for table in snapshot.map.in_order() {
            consider(if latest {
                table.try_get_latest(stream)?
            } else {
                table.try_get_oldest(stream)?
            });
        }

        Ok(best)
    }

    /// Returns the entry with the highest event number of the stream
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a table is corrupt.
    pub fn try_get_latest_entry(&self, stream: u64) -> crate::Result<Option<IndexEntry>> {
        self.pick_entry(stream, |m| m.latest(stream), |a, b| a > b, true)
    }

    /// Returns the entry with the lowest event number of the stream
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a table is corrupt.
    pub fn try_get_oldest_entry(&self, stream: u64) -> crate::Result<Option<IndexEntry>> {
        self.pick_entry(stream, |m| m.oldest(stream), |a, b| a < b, false)
    }

    /// Returns up to `limit` entries of the stream with `from <= version <= to`,
    /// highest event number first
    ///
    /// If an event is found in multiple sources, the newest source wins.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or a table is corrupt.
    pub fn get_range(
        &self,
        stream: u64,
        from: i64,
        to: i64,
        limit: usize,
    ) -> crate::Result<Vec<IndexEntry>> {
        let snapshot = self.snapshot();
        let mut sources: Vec<BoxedIterator<'_>> = vec![];

        for memtable in snapshot.memtables() {
            let entries = memtable.range(stream, from, to).take(limit).collect::<Vec<_>>();
            sources.push(Box::new(entries.into_iter().map(Ok)));
        }

        for table in snapshot.map.in_order() {
            let entries = table.get_range(stream, from, to, limit)?;
            sources.push(Box::new(entries.into_iter().map(Ok)));
        }

        MergeIterator::new(sources).take(limit).collect()
    }

    /// Merges all tables at or above the max auto-merge level into one
    ///
    /// Returns `true` if tables were merged.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Poisoned`] if the index worker failed.
    pub fn merge_all(&self) -> crate::Result<bool> {
        if self.is_poisoned() {
            return Err(crate::Error::Poisoned);
        }

        self.0.merge_all()
    }

    /// Blocks until all sealed memtables are flushed and no level is due for merging
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Poisoned`] if the index worker failed.
    pub fn wait_for_background_tasks(&self) -> crate::Result<()> {
        loop {
            if self.is_poisoned() {
                return Err(crate::Error::Poisoned);
            }

            let snapshot = self.snapshot();
            if snapshot.sealed.is_empty() && !snapshot.map.needs_merge() {
                return Ok(());
            }

            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl TableIndexInner {
    fn swap(&self, snapshot: IndexSnapshot) {
        #[allow(clippy::expect_used)]
        let mut lock = self.snapshot.write().expect("lock is poisoned");
        *lock = Arc::new(snapshot);
    }

    fn current(&self) -> Arc<IndexSnapshot> {
        #[allow(clippy::expect_used)]
        self.snapshot.read().expect("lock is poisoned").clone()
    }

    fn next_table_path(&self) -> (u64, PathBuf) {
        let id = self.next_table_id.fetch_add(1, Ordering::AcqRel);
        (id, self.folder.join(table_file_name(id)))
    }

    /// Saves the map, publishes it and moves the index checkpoint
    ///
    /// `update` derives the new snapshot from the current one, under the swap lock.
    fn publish<F: FnOnce(&IndexSnapshot) -> IndexSnapshot>(
        &self,
        map: &IndexMap,
        update: F,
    ) -> crate::Result<()> {
        map.save(self.folder.join(INDEX_MAP_FILE))?;

        {
            #[allow(clippy::expect_used)]
            let _lock = self.swap_lock.lock().expect("lock is poisoned");
            let current = self.current();
            self.swap(update(&*current));
        }

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.write(map.commit_checkpoint());
            checkpoint.flush()?;
        }

        Ok(())
    }

    /// Writes the oldest sealed memtable to a table, returns `false` if there was none
    fn flush_oldest_memtable(&self) -> crate::Result<bool> {
        #[allow(clippy::expect_used)]
        let _lock = self.map_lock.lock().expect("lock is poisoned");

        let Some(memtable) = self.current().sealed.last().cloned() else {
            return Ok(false);
        };

        let (id, path) = self.next_table_path();
        log::debug!("Flushing memtable with {} entries to {path:?}", memtable.len());

        PTable::write(
            &path,
            memtable.iter().map(Ok),
            self.config.cache_depth,
            &self.stop_signal,
        )?;
        let table = PTable::open(&path, id, false, self.config.descriptor_count)?;

        let map = self.current().map.add_ptable(
            Arc::new(table),
            memtable.prepare_checkpoint(),
            memtable.commit_checkpoint(),
        );

        self.publish(&map, |current| IndexSnapshot {
            active: current.active.clone(),
            sealed: current
                .sealed
                .iter()
                .filter(|m| !Arc::ptr_eq(m, &memtable))
                .cloned()
                .collect(),
            map: map.clone(),
        })?;

        Ok(true)
    }

    fn apply_merge(&self, result: map::MergeResult) -> crate::Result<()> {
        self.publish(&result.map, |current| IndexSnapshot {
            active: current.active.clone(),
            sealed: current.sealed.clone(),
            map: result.map.clone(),
        })?;

        // IMPORTANT: Only delete inputs once the new map is durable
        for table in &result.to_delete {
            table.mark_for_deletion();
        }

        Ok(())
    }

    /// Merges levels until no level is full
    fn merge_levels(&self) -> crate::Result<()> {
        loop {
            if self.stop_signal.is_stopped() {
                return Ok(());
            }

            #[allow(clippy::expect_used)]
            let _lock = self.map_lock.lock().expect("lock is poisoned");

            let map = self.current().map.clone();
            if !map.needs_merge() {
                return Ok(());
            }

            let (id, _) = self.next_table_path();

            let Some(result) =
                map.try_merge_one_level(&self.folder, id, &self.config, &self.stop_signal)?
            else {
                return Ok(());
            };

            let has_more = result.has_more;
            self.apply_merge(result)?;

            if !has_more {
                return Ok(());
            }
        }
    }

    fn merge_all(&self) -> crate::Result<bool> {
        #[allow(clippy::expect_used)]
        let _lock = self.map_lock.lock().expect("lock is poisoned");

        let map = self.current().map.clone();
        let (id, _) = self.next_table_path();

        let Some(result) = map.merge_all(&self.folder, id, &self.config, &self.stop_signal)?
        else {
            return Ok(false);
        };

        self.apply_merge(result)?;
        Ok(true)
    }
}

struct IndexWorker(Arc<TableIndexInner>);

impl Activity for IndexWorker {
    fn name(&self) -> &'static str {
        "index worker"
    }

    fn run(&mut self) -> crate::Result<()> {
        log::trace!("index worker: waiting for work");
        self.0.semaphore.acquire();

        if self.0.stop_signal.is_stopped() {
            return Ok(());
        }

        while self.0.flush_oldest_memtable()? {
            if self.0.stop_signal.is_stopped() {
                return Ok(());
            }
        }

        self.0.merge_levels()
    }
}
