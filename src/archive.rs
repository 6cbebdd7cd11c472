// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checkpoint::Checkpoints,
    chunk::{naming::list_chunk_files, naming::ChunkFileName, Chunk},
    file::{fsync_directory, TEMP_FILE_EXT},
    stop_signal::StopSignal,
    Config,
};
use std::{path::Path, time::Duration};

/// Remote storage holding completed chunks
pub trait ArchiveStorage: Send + Sync {
    /// Log position up to which completed chunks are available
    ///
    /// # Errors
    ///
    /// Errors are treated as transient and retried.
    fn archived_position(&self) -> std::io::Result<i64>;

    /// Downloads the chunk file with the given number to `destination`
    ///
    /// # Errors
    ///
    /// Errors are treated as transient and retried.
    fn fetch_chunk(&self, chunk_number: i32, destination: &Path) -> std::io::Result<()>;
}

/// Fetches chunks that exist in the archive, but not locally, before the database is opened
pub struct ArchiveCatchup<'a, S: ArchiveStorage> {
    config: &'a Config,
    storage: S,
    retry_interval: Duration,
    stop_signal: StopSignal,
}

impl<'a, S: ArchiveStorage> ArchiveCatchup<'a, S> {
    /// Creates a catch-up for the database described by `config`
    pub fn new(config: &'a Config, storage: S, stop_signal: StopSignal) -> Self {
        Self {
            config,
            storage,
            retry_interval: Duration::from_secs(5),
            stop_signal,
        }
    }

    /// Sets the delay between two attempts of a failed fetch.
    ///
    /// Default = 5s
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    fn retry<T, F: Fn() -> std::io::Result<T>>(&self, what: &str, f: F) -> crate::Result<T> {
        loop {
            if self.stop_signal.is_stopped() {
                return Err(crate::Error::Cancelled);
            }

            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    log::warn!(
                        "{what} failed: {e:?}, retrying in {}ms",
                        self.retry_interval.as_millis()
                    );
                    std::thread::sleep(self.retry_interval);
                }
            }
        }
    }

    /// Fetches all missing chunks, returns the amount of chunks fetched
    ///
    /// Every fetched chunk is committed on its own: written to a temporary file,
    /// validated, renamed, then the writer and replication checkpoints are moved past it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Cancelled`] if the stop signal was sent,
    /// [`crate::Error::BadChunkInDatabase`] if the archive returned a chunk that does not fit.
    pub fn run(&self) -> crate::Result<usize> {
        let folder = self.config.path();
        std::fs::create_dir_all(folder)?;

        let checkpoints = Checkpoints::open(folder)?;
        let chunk_size = i64::from(self.config.chunk_size);

        let archived = self.retry("Reading archive position", || {
            self.storage.archived_position()
        })?;

        let mut writer = checkpoints.writer.read();
        let mut fetched = 0;

        if writer >= archived {
            log::debug!("No archive catch-up needed, writer at {writer}, archive at {archived}");
            return Ok(0);
        }

        log::info!("Catching up from archive: writer at {writer}, archive at {archived}");

        while writer < archived {
            let number = (writer / chunk_size) as i32;
            let name = ChunkFileName {
                number: number as u32,
                version: 0,
            };
            let temp_path = folder.join(format!("{}.archive.{TEMP_FILE_EXT}", name.file_name()));

            let result = self
                .retry(&format!("Fetching chunk {number}"), || {
                    self.storage.fetch_chunk(number, &temp_path)
                })
                .and_then(|()| self.validate(&temp_path, number));

            let end_position = match result {
                Ok(end_position) => end_position,
                Err(e) => {
                    if let Err(e) = std::fs::remove_file(&temp_path) {
                        log::trace!("Could not remove {temp_path:?}: {e:?}");
                    }
                    return Err(e);
                }
            };

            // NOTE: A local, incomplete version of the chunk is superseded
            for (existing, path) in list_chunk_files(folder)? {
                if existing.number == name.number {
                    log::debug!("Removing local chunk {path:?} replaced by archive");
                    std::fs::remove_file(path)?;
                }
            }

            std::fs::rename(&temp_path, folder.join(name.file_name()))?;

            // IMPORTANT: fsync folder on Unix
            fsync_directory(folder)?;

            // IMPORTANT: The chunk is durable, only now the checkpoints may claim it
            writer = end_position;
            checkpoints.writer.write(writer);
            checkpoints.writer.flush()?;
            checkpoints.replication.write(writer);
            checkpoints.replication.flush()?;

            fetched += 1;
            log::debug!("Fetched chunk {number} from archive, writer now at {writer}");
        }

        Ok(fetched)
    }

    fn validate(&self, path: &Path, number: i32) -> crate::Result<i64> {
        let chunk = Chunk::open_completed(path, true, 1)?;
        let header = chunk.header();

        if header.chunk_start_number != number || header.chunk_size != self.config.chunk_size {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!(
                    "expected chunk {number} of size {}, archive returned chunk {} of size {}",
                    self.config.chunk_size, header.chunk_start_number, header.chunk_size
                ),
            });
        }

        Ok(header.chunk_end_position())
    }
}
