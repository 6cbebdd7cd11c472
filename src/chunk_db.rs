// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checkpoint::Checkpoints,
    chunk::{
        footer::CHUNK_FOOTER_SIZE,
        header::{ChunkHeader, CHUNK_HEADER_SIZE},
        manager::{ChunkManager, ChunkOptions},
        naming::{list_chunk_files, ChunkFileName},
        Chunk,
    },
    file::fsync_directory,
    Config,
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The chunked transaction log: checkpoints and chunk files
pub struct ChunkDb {
    config: Config,
    checkpoints: Checkpoints,
    manager: ChunkManager,
}

fn read_chunk_header(path: &Path) -> crate::Result<ChunkHeader> {
    let mut buf = [0; CHUNK_HEADER_SIZE];
    File::open(path)?.read_exact(&mut buf)?;
    ChunkHeader::decode(path, &buf)
}

impl ChunkDb {
    /// Opens the log in the configured folder, creating it if needed
    ///
    /// # Errors
    ///
    /// Fails if checkpoints are inconsistent, a chunk is missing or damaged.
    pub fn open(config: Config) -> crate::Result<Self> {
        let folder = config.path.clone();
        log::debug!("Opening chunk database at {folder:?}");

        std::fs::create_dir_all(&folder)?;

        let checkpoints = Checkpoints::open(&folder)?;
        checkpoints.validate_order()?;

        let manager = ChunkManager::new(
            &folder,
            ChunkOptions {
                chunk_size: config.chunk_size,
                transform: config.chunk_transform,
                alignment_size: config.alignment_size,
                descriptor_count: config.descriptor_count,
            },
        );

        let db = Self {
            config,
            checkpoints,
            manager,
        };

        db.remove_old_chunk_versions()?;

        let truncate = db.checkpoints.truncate.read();
        if truncate >= 0 {
            db.truncate_to(truncate)?;
        }

        db.load_chunks()?;

        Ok(db)
    }

    /// Database configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checkpoints of the log
    #[must_use]
    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    /// Chunks of the log
    #[must_use]
    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    /// Logical chunk size
    #[must_use]
    pub fn chunk_size(&self) -> i64 {
        i64::from(self.config.chunk_size)
    }

    /// Returns the chunk containing the given log position
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChunkNotFound`] if no chunk covers the position.
    pub fn get_chunk_for(&self, position: i64) -> crate::Result<Arc<Chunk>> {
        self.manager.get_chunk_for(position)
    }

    fn chunk_files_by_number(&self) -> crate::Result<BTreeMap<u32, (ChunkFileName, PathBuf)>> {
        let mut by_number = BTreeMap::new();

        // NOTE: Files are sorted by (number, version), so the newest version wins
        for (name, path) in list_chunk_files(&self.config.path)? {
            by_number.insert(name.number, (name, path));
        }

        Ok(by_number)
    }

    fn remove_old_chunk_versions(&self) -> crate::Result<()> {
        let newest = self.chunk_files_by_number()?;

        for (name, path) in list_chunk_files(&self.config.path)? {
            let is_newest = newest
                .get(&name.number)
                .is_some_and(|(newest, _)| newest.version == name.version);

            if !is_newest {
                log::info!("Removing old chunk version {path:?}");
                std::fs::remove_file(&path)?;
            }
        }

        for dirent in std::fs::read_dir(&self.config.path)? {
            let dirent = dirent?;
            let file_name = dirent.file_name();

            if file_name
                .to_str()
                .is_some_and(|name| name.ends_with(crate::file::TEMP_FILE_EXT))
                && dirent.file_type()?.is_file()
            {
                log::info!("Removing leftover temporary file {:?}", dirent.path());
                std::fs::remove_file(dirent.path())?;
            }
        }

        Ok(())
    }

    /// Cuts the log at `position`: later chunks are removed, the chunk containing
    /// the position is reopened as active, and checkpoints are lowered
    fn truncate_to(&self, position: i64) -> crate::Result<()> {
        let writer = self.checkpoints.writer.read();
        log::warn!("Truncating log from {writer} to {position}");

        if position > writer {
            return Err(crate::Error::ReaderCheckpointHigherThanWriter {
                checkpoint: self.checkpoints.truncate.name(),
                reader: position,
                writer,
            });
        }

        let chunk_number = position / self.chunk_size();

        for (number, (_, path)) in self.chunk_files_by_number()? {
            if i64::from(number) > chunk_number {
                log::info!("Removing truncated chunk {path:?}");
                std::fs::remove_file(&path)?;
            } else if i64::from(number) == chunk_number {
                let header = read_chunk_header(&path)?;

                if header.is_scavenged || header.chunk_start_number != header.chunk_end_number {
                    return Err(crate::Error::BadChunkInDatabase {
                        path,
                        reason: format!("can not truncate scavenged chunk to {position}"),
                    });
                }

                let data_start = (CHUNK_HEADER_SIZE + header.transform.header_size()) as u64;
                let local = (position - header.chunk_start_position()) as u64;

                // NOTE: Cutting the file also removes the footer, which makes the chunk active again
                let file = File::options().write(true).open(&path)?;
                file.set_len(data_start + local)?;
                file.set_len(
                    data_start + header.chunk_size as u64 + CHUNK_FOOTER_SIZE as u64,
                )?;
                file.sync_all()?;
            }
        }

        fsync_directory(&self.config.path)?;

        // IMPORTANT: Lower checkpoints before resetting the truncate checkpoint,
        // so a crash in between truncates again
        self.checkpoints.writer.write(position);
        self.checkpoints.writer.flush()?;

        for checkpoint in [&self.checkpoints.chaser, &self.checkpoints.replication] {
            if checkpoint.read() > position {
                checkpoint.write(position);
                checkpoint.flush()?;
            }
        }

        if self.checkpoints.epoch.read() >= position {
            self.checkpoints.epoch.write(-1);
            self.checkpoints.epoch.flush()?;
        }

        self.checkpoints.truncate.write(-1);
        self.checkpoints.truncate.flush()?;

        Ok(())
    }

    fn load_chunks(&self) -> crate::Result<()> {
        let files = self.chunk_files_by_number()?;
        let chunk_size = self.chunk_size();

        let mut writer = self.checkpoints.writer.read();
        let mut number: i64 = 0;

        while number * chunk_size <= writer {
            let Some((_, path)) = u32::try_from(number)
                .ok()
                .and_then(|number| files.get(&number))
            else {
                if number * chunk_size == writer {
                    // Nothing was written into this chunk yet
                    self.manager.add_new_chunk()?;
                    break;
                }

                log::error!("Chunk {number} is missing, writer checkpoint is at {writer}");
                return Err(crate::Error::ChunkNotFound(number));
            };

            let header = read_chunk_header(path)?;

            if i64::from(header.chunk_start_number) != number {
                return Err(crate::Error::BadChunkInDatabase {
                    path: path.clone(),
                    reason: format!(
                        "expected chunk number {number}, found {}",
                        header.chunk_start_number
                    ),
                });
            }

            if header.chunk_size != self.config.chunk_size {
                return Err(crate::Error::BadChunkInDatabase {
                    path: path.clone(),
                    reason: format!(
                        "expected chunk size {}, found {}",
                        self.config.chunk_size, header.chunk_size
                    ),
                });
            }

            let contains_writer = header.contains(writer);

            let chunk = if contains_writer {
                match Chunk::open_active(
                    path,
                    writer - header.chunk_start_position(),
                    self.config.alignment_size,
                    self.config.descriptor_count,
                ) {
                    Ok(chunk) => chunk,
                    Err(crate::Error::BadChunkInDatabase { .. }) => {
                        // NOTE: The chunk was completed, but the writer checkpoint was not moved yet
                        let chunk = Chunk::open_completed(
                            path,
                            self.config.verify_chunk_hashes,
                            self.config.descriptor_count,
                        )?;

                        writer = header.chunk_end_position();
                        log::info!("Chunk {path:?} is completed, moving writer checkpoint to {writer}");
                        self.checkpoints.writer.write(writer);
                        self.checkpoints.writer.flush()?;

                        chunk
                    }
                    Err(e) => return Err(e),
                }
            } else {
                Chunk::open_completed(
                    path,
                    self.config.verify_chunk_hashes,
                    self.config.descriptor_count,
                )?
            };

            log::trace!("Loaded {chunk:?}");
            self.manager.add_chunk(Arc::new(chunk));

            number = i64::from(header.chunk_end_number) + 1;
        }

        for (extra, (_, path)) in files.range(u32::try_from(number).unwrap_or(u32::MAX)..) {
            if self.manager.get_chunk(*extra as i32).is_none() {
                log::warn!("Removing chunk {path:?} beyond writer checkpoint {writer}");
                std::fs::remove_file(path)?;
            }
        }

        log::debug!(
            "Loaded {} chunks, writer checkpoint at {writer}",
            self.manager.chunk_count()
        );

        Ok(())
    }
}
