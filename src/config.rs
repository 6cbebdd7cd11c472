// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{chunk::transform::ChunkTransform, path::absolute_path, Database};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_CPU_CORES: usize = 4;

/// Reader handles that are not accounted to any worker
const READER_POOL_RESERVE: usize = 4;

/// Database configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Base path of database
    pub(crate) path: PathBuf,

    /// When true, the path will be deleted upon drop
    pub(crate) clean_path_on_drop: bool,

    /// Logical size of a chunk in bytes
    pub(crate) chunk_size: i32,

    /// Transform new chunks are written with
    pub(crate) chunk_transform: ChunkTransform,

    /// The footer of completed chunks starts at a multiple of this value
    pub(crate) alignment_size: u32,

    /// Verify the MD5 hash of completed chunks on open
    pub(crate) verify_chunk_hashes: bool,

    /// Minimum delay between two non-forced writer flushes
    pub(crate) min_flush_delay: Duration,

    /// Read handles kept open per chunk
    pub(crate) descriptor_count: usize,

    /// Amount of threads reading through the reader pool
    pub(crate) reader_threads: usize,

    /// Amount of background index merge threads
    pub(crate) merge_threads: usize,

    /// Entries a memtable holds before it is flushed to a table
    pub(crate) max_memtable_entries: usize,

    /// Tables a level holds before it is merged into the next level
    pub(crate) max_tables_per_level: usize,

    /// Levels at or above this level are not merged automatically
    pub(crate) max_auto_merge_level: u32,

    /// Depth of the midpoint cache of tables, `2^depth` midpoints at most
    pub(crate) index_cache_depth: u32,

    /// Verify the MD5 hash of index tables on open
    pub(crate) verify_index_hashes: bool,
}

impl Config {
    /// Creates a new configuration
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let queried_cores = std::thread::available_parallelism().map(usize::from);

        // Reserve 1 CPU core if possible
        let cpus = (queried_cores.unwrap_or(DEFAULT_CPU_CORES) - 1)
            // Should never be 0
            .max(1);

        Self {
            path: absolute_path(path),
            clean_path_on_drop: false,
            chunk_size: /* 256 MiB */ 256 * 1_024 * 1_024,
            chunk_transform: ChunkTransform::Identity,
            alignment_size: 4_096,
            verify_chunk_hashes: true,
            min_flush_delay: Duration::from_millis(2),
            descriptor_count: 2,
            reader_threads: cpus.min(4),
            merge_threads: 1,
            max_memtable_entries: 1_000_000,
            max_tables_per_level: 4,
            max_auto_merge_level: u32::MAX,
            index_cache_depth: 16,
            verify_index_hashes: true,
        }
    }

    /// Sets the logical chunk size in bytes.
    ///
    /// Default = 256 MiB
    ///
    /// # Panics
    ///
    /// Panics if the size is below 1 KiB.
    #[must_use]
    pub fn chunk_size(mut self, bytes: i32) -> Self {
        assert!(bytes >= 1_024);

        self.chunk_size = bytes;
        self
    }

    /// Sets the transform new chunks are written with.
    ///
    /// Existing chunks keep their transform.
    ///
    /// Default = [`ChunkTransform::Identity`]
    #[must_use]
    pub fn chunk_transform(mut self, transform: ChunkTransform) -> Self {
        self.chunk_transform = transform;
        self
    }

    /// Sets the alignment of chunk footers.
    ///
    /// Default = 4 KiB
    ///
    /// # Panics
    ///
    /// Panics if the alignment is 0.
    #[must_use]
    pub fn alignment_size(mut self, bytes: u32) -> Self {
        assert!(bytes > 0);

        self.alignment_size = bytes;
        self
    }

    /// If `true`, the hashes of completed chunks are verified when the database is opened.
    ///
    /// Default = true
    #[must_use]
    pub fn verify_chunk_hashes(mut self, flag: bool) -> Self {
        self.verify_chunk_hashes = flag;
        self
    }

    /// Sets the minimum delay between two writer flushes that are not forced.
    ///
    /// Default = 2ms
    #[must_use]
    pub fn min_flush_delay(mut self, delay: Duration) -> Self {
        self.min_flush_delay = delay;
        self
    }

    /// Sets the amount of threads that read events concurrently.
    ///
    /// Default = min(#CPU cores - 1, 4)
    ///
    /// # Panics
    ///
    /// Panics if the count is 0.
    #[must_use]
    pub fn reader_threads(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.reader_threads = n;
        self
    }

    /// Sets the amount of entries a memtable holds before it is written to an index table.
    ///
    /// Default = 1,000,000
    ///
    /// # Panics
    ///
    /// Panics if the count is 0.
    #[must_use]
    pub fn max_memtable_entries(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.max_memtable_entries = n;
        self
    }

    /// Sets the amount of tables per level that triggers a merge.
    ///
    /// Default = 4
    ///
    /// # Panics
    ///
    /// Panics if the count is below 2.
    #[must_use]
    pub fn max_tables_per_level(mut self, n: usize) -> Self {
        assert!(n >= 2);

        self.max_tables_per_level = n;
        self
    }

    /// Sets the level at which automatic merging stops.
    ///
    /// Tables at or above this level are only merged by [`Database::merge_index`].
    ///
    /// Default = unlimited
    #[must_use]
    pub fn max_auto_merge_level(mut self, level: u32) -> Self {
        self.max_auto_merge_level = level;
        self
    }

    /// Sets the depth of the midpoint cache of index tables.
    ///
    /// Default = 16
    ///
    /// # Panics
    ///
    /// Panics if the depth is above 28.
    #[must_use]
    pub fn index_cache_depth(mut self, depth: u32) -> Self {
        assert!(depth <= 28);

        self.index_cache_depth = depth;
        self
    }

    /// If `true`, the hashes of index tables are verified when they are opened.
    ///
    /// Default = true
    #[must_use]
    pub fn verify_index_hashes(mut self, flag: bool) -> Self {
        self.verify_index_hashes = flag;
        self
    }

    /// If `true`, the database folder is deleted when the database is dropped.
    ///
    /// Default = false
    #[must_use]
    pub fn temporary(mut self, flag: bool) -> Self {
        self.clean_path_on_drop = flag;
        self
    }

    /// Base path of the database
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Amount of reader handles in the reader pool
    ///
    /// One each for the writer and the chaser, one per merge thread and reader thread,
    /// plus a small reserve.
    #[must_use]
    pub fn reader_pool_size(&self) -> usize {
        1 + 1 + self.merge_threads + self.reader_threads + READER_POOL_RESERVE
    }

    /// Opens a database using the config.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the database is damaged.
    pub fn open(self) -> crate::Result<Database> {
        Database::open(self)
    }
}
