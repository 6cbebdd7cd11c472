// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{header::ChunkHeader, naming::ChunkFileName, transform::ChunkTransform, Chunk};
use crate::version::Version;
use dashmap::DashMap;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

/// Parameters new chunks are created with
#[derive(Copy, Clone, Debug)]
pub struct ChunkOptions {
    /// Logical capacity of a chunk in bytes
    pub chunk_size: i32,

    /// Transform new chunks are written with
    pub transform: ChunkTransform,

    /// The footer of completed chunks starts at a multiple of this value
    pub alignment_size: u32,

    /// Read handles kept open per chunk
    pub descriptor_count: usize,
}

/// Keeps track of all chunks of a database, keyed by chunk number
///
/// A chunk covering a range of numbers is registered once per number.
pub struct ChunkManager {
    folder: PathBuf,
    options: ChunkOptions,
    chunks: DashMap<i32, Arc<Chunk>, xxhash_rust::xxh3::Xxh3Builder>,

    /// Number the next new chunk will get
    chunk_count: AtomicI32,
}

impl ChunkManager {
    /// Creates an empty chunk manager
    pub fn new<P: AsRef<Path>>(folder: P, options: ChunkOptions) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            options,
            chunks: DashMap::with_hasher(xxhash_rust::xxh3::Xxh3Builder::new()),
            chunk_count: AtomicI32::default(),
        }
    }

    /// Database folder
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Options new chunks are created with
    #[must_use]
    pub fn options(&self) -> &ChunkOptions {
        &self.options
    }

    /// Logical chunk size
    #[must_use]
    pub fn chunk_size(&self) -> i64 {
        i64::from(self.options.chunk_size)
    }

    /// Amount of chunk numbers covered
    #[must_use]
    pub fn chunk_count(&self) -> i32 {
        self.chunk_count.load(Ordering::Acquire)
    }

    /// Registers an opened chunk
    pub fn add_chunk(&self, chunk: Arc<Chunk>) {
        let header = *chunk.header();

        for number in header.chunk_start_number..=header.chunk_end_number {
            self.chunks.insert(number, chunk.clone());
        }

        self.chunk_count
            .fetch_max(header.chunk_end_number + 1, Ordering::AcqRel);
    }

    /// Creates and registers the next chunk
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn add_new_chunk(&self) -> crate::Result<Arc<Chunk>> {
        let number = self.chunk_count();

        let file_name = ChunkFileName {
            number: number as u32,
            version: 0,
        };

        let header = ChunkHeader {
            version: Version::CURRENT,
            chunk_size: self.options.chunk_size,
            chunk_start_number: number,
            chunk_end_number: number,
            is_scavenged: false,
            transform: self.options.transform,
        };

        let chunk = Arc::new(Chunk::create(
            self.folder.join(file_name.file_name()),
            header,
            self.options.alignment_size,
            self.options.descriptor_count,
        )?);

        self.add_chunk(chunk.clone());

        log::debug!("Added chunk {number}");

        Ok(chunk)
    }

    /// Returns the chunk with the given number
    #[must_use]
    pub fn get_chunk(&self, number: i32) -> Option<Arc<Chunk>> {
        self.chunks.get(&number).map(|entry| entry.value().clone())
    }

    /// Returns the chunk containing the given global log position
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChunkNotFound`] if no chunk covers the position.
    pub fn get_chunk_for(&self, position: i64) -> crate::Result<Arc<Chunk>> {
        if position < 0 {
            return Err(crate::Error::ChunkNotFound(position));
        }

        let number = i32::try_from(position / self.chunk_size())
            .map_err(|_| crate::Error::ChunkNotFound(position))?;

        self.get_chunk(number)
            .ok_or(crate::Error::ChunkNotFound(position))
    }

    /// Returns the chunk with the highest number
    #[must_use]
    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.get_chunk(self.chunk_count() - 1)
    }

    /// Replaces the chunks covered by `chunk`, marking the replaced ones for deletion
    ///
    /// Readers that still hold a replaced chunk get [`crate::Error::FileBeingDeleted`]
    /// and look the chunk up again.
    pub fn switch_chunk(&self, chunk: Arc<Chunk>) {
        let header = *chunk.header();
        let mut replaced: Vec<Arc<Chunk>> = vec![];

        for number in header.chunk_start_number..=header.chunk_end_number {
            if let Some(old) = self.chunks.insert(number, chunk.clone()) {
                if !replaced.iter().any(|c| Arc::ptr_eq(c, &old)) {
                    replaced.push(old);
                }
            }
        }

        for old in replaced {
            log::debug!("Switched {old:?} to {chunk:?}");
            old.mark_for_deletion();
        }
    }
}
