// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod footer;
pub mod header;
pub mod manager;
pub mod naming;
pub mod transform;

use crate::{
    descriptor_table::FileDescriptorTable,
    file::fsync_directory,
    record::{LogRecord, FRAME_OVERHEAD},
    DecodeError,
};
use byteorder::{ByteOrder, LittleEndian};
use footer::{ChunkFooter, PosMapEntry, CHUNK_FOOTER_SIZE, CHUNK_HASH_SIZE};
use header::{ChunkHeader, CHUNK_HEADER_SIZE};
use md5::{Digest, Md5};
use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
};

/// A record read from a chunk
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkRecord {
    /// The decoded record
    pub record: LogRecord,

    /// Logical offset of the record inside the chunk
    pub offset: i64,

    /// Length of the record frame
    pub length: i64,
}

impl ChunkRecord {
    /// Logical offset directly after the record
    #[must_use]
    pub fn next_offset(&self) -> i64 {
        self.offset + self.length
    }
}

/// Result of trying to append a record to a chunk
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AppendResult {
    /// The record was written
    Written {
        /// Logical offset of the record
        offset: i64,

        /// Logical offset after the record
        next: i64,
    },

    /// The record does not fit into the remaining space
    ChunkFull,
}

struct ChunkAppender {
    writer: BufWriter<File>,
    hasher: Md5,
    physical_written: i64,
}

impl ChunkAppender {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }
}

struct CompletedState {
    footer: ChunkFooter,
    pos_map: Arc<[PosMapEntry]>,
}

/// A segment of the transaction log
///
/// A chunk is either *active* (accepting appends, at most one per database)
/// or *completed* (immutable, footer and hash written).
///
/// Dropping the last handle of a chunk that was marked for deletion removes its file,
/// so readers holding an `Arc<Chunk>` can finish their reads safely.
pub struct Chunk {
    path: PathBuf,
    header: ChunkHeader,
    data_start: u64,
    alignment_size: u64,

    descriptor_table: FileDescriptorTable,

    completed: RwLock<Option<CompletedState>>,
    appender: Mutex<Option<ChunkAppender>>,

    /// Physical data bytes that are visible to readers
    readable_size: AtomicI64,

    is_deleted: AtomicBool,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunk({}-{}, {:?})",
            self.header.chunk_start_number, self.header.chunk_end_number, self.path
        )
    }
}

fn read_header_and_transform(path: &Path, file: &mut File) -> crate::Result<(ChunkHeader, u64)> {
    let mut buf = [0; CHUNK_HEADER_SIZE];
    file.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            crate::Error::InvalidFile(crate::InvalidFileError {
                path: path.to_path_buf(),
                reason: "file is shorter than a chunk header".into(),
            })
        } else {
            e.into()
        }
    })?;

    let header = ChunkHeader::decode(path, &buf)?;

    let mut transform_header = vec![0; header.transform.header_size()];
    file.read_exact(&mut transform_header)?;

    if !header.transform.validate_header(&transform_header) {
        return Err(crate::Error::BadChunkInDatabase {
            path: path.to_path_buf(),
            reason: format!("invalid {:?} transform header", header.transform),
        });
    }

    let data_start = (CHUNK_HEADER_SIZE + header.transform.header_size()) as u64;

    Ok((header, data_start))
}

impl Chunk {
    /// Creates a new, empty chunk file
    ///
    /// The file is preallocated to its maximum size.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the file already exists.
    pub fn create<P: AsRef<Path>>(
        path: P,
        header: ChunkHeader,
        alignment_size: u32,
        descriptor_count: usize,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        log::debug!("Creating chunk {} at {path:?}", header.chunk_start_number);

        let file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        let data_start = (CHUNK_HEADER_SIZE + header.transform.header_size()) as u64;
        file.set_len(data_start + header.chunk_size as u64 + CHUNK_FOOTER_SIZE as u64)?;

        let mut appender = ChunkAppender {
            writer: BufWriter::new(file),
            hasher: Md5::new(),
            physical_written: 0,
        };

        appender.write_all(&header.encode())?;

        let mut transform_header = Vec::with_capacity(header.transform.header_size());
        header.transform.write_header(&mut transform_header)?;
        appender.write_all(&transform_header)?;

        appender.writer.flush()?;
        appender.writer.get_ref().sync_all()?;

        // IMPORTANT: fsync folder on Unix
        if let Some(folder) = path.parent() {
            fsync_directory(folder)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            data_start,
            alignment_size: u64::from(alignment_size.max(1)),
            descriptor_table: FileDescriptorTable::new(path, descriptor_count)?,
            completed: RwLock::default(),
            appender: Mutex::new(Some(appender)),
            readable_size: AtomicI64::default(),
            is_deleted: AtomicBool::default(),
        })
    }

    /// Opens a completed chunk
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::BadChunkInDatabase`] if the chunk is not completed,
    /// [`crate::Error::HashValidation`] if `verify_hash` is set and the hash does not match.
    pub fn open_completed<P: AsRef<Path>>(
        path: P,
        verify_hash: bool,
        descriptor_count: usize,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        log::trace!("Opening completed chunk at {path:?}");

        let mut file = File::open(path)?;
        let (header, data_start) = read_header_and_transform(path, &mut file)?;

        let file_size = file.metadata()?.len();
        if file_size < data_start + CHUNK_FOOTER_SIZE as u64 {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!("file size {file_size} is too small for a completed chunk"),
            });
        }

        let footer_start = file_size - CHUNK_FOOTER_SIZE as u64;
        let mut footer_bytes = [0; CHUNK_FOOTER_SIZE];
        file.seek(SeekFrom::Start(footer_start))?;
        file.read_exact(&mut footer_bytes)?;
        let footer = ChunkFooter::decode(path, &footer_bytes)?;

        if !footer.is_completed {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: "chunk is not completed".into(),
            });
        }

        let map_start = data_start + footer.physical_data_size as u64;
        if footer.physical_data_size < 0
            || footer.map_size < 0
            || map_start + footer.map_size as u64 > footer_start
            || i64::from(footer.physical_data_size) > footer.logical_data_size
        {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!("footer does not fit file: {footer:?}"),
            });
        }

        if verify_hash {
            let mut hasher = Md5::new();
            file.seek(SeekFrom::Start(0))?;
            std::io::copy(
                &mut (&mut file).take(file_size - CHUNK_HASH_SIZE as u64),
                &mut hasher,
            )?;

            if hasher.finalize().as_slice() != footer.hash {
                log::error!("Chunk {path:?} failed hash validation");
                return Err(crate::Error::HashValidation(path.to_path_buf()));
            }
        }

        let pos_map: Arc<[PosMapEntry]> = if footer.has_pos_map {
            let mut bytes = vec![0; footer.map_size as usize];
            file.seek(SeekFrom::Start(map_start))?;
            file.read_exact(&mut bytes)?;
            PosMapEntry::decode_all(&bytes)?.into()
        } else {
            Arc::new([])
        };

        Ok(Self {
            path: path.to_path_buf(),
            header,
            data_start,
            alignment_size: 1,
            descriptor_table: FileDescriptorTable::new(path, descriptor_count)?,
            readable_size: AtomicI64::new(i64::from(footer.physical_data_size)),
            completed: RwLock::new(Some(CompletedState { footer, pos_map })),
            appender: Mutex::default(),
            is_deleted: AtomicBool::default(),
        })
    }

    /// Reopens the active chunk, continuing after `data_size` bytes of data
    ///
    /// Bytes after `data_size` are overwritten by following appends.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::BadChunkInDatabase`] if the chunk is already completed,
    /// or `data_size` is out of bounds.
    pub fn open_active<P: AsRef<Path>>(
        path: P,
        data_size: i64,
        alignment_size: u32,
        descriptor_count: usize,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        log::debug!("Opening active chunk at {path:?} with {data_size} bytes of data");

        let mut file = File::options().read(true).write(true).open(path)?;
        let (header, data_start) = read_header_and_transform(path, &mut file)?;

        if data_size < 0 || data_size > i64::from(header.chunk_size) {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!(
                    "data size {data_size} out of bounds (chunk size {})",
                    header.chunk_size
                ),
            });
        }

        let file_size = file.metadata()?.len();
        let data_end = data_start + data_size as u64;

        if file_size < data_end {
            return Err(crate::Error::BadChunkInDatabase {
                path: path.to_path_buf(),
                reason: format!("file size {file_size} is smaller than data end {data_end}"),
            });
        }

        if file_size >= data_end + CHUNK_FOOTER_SIZE as u64 {
            let mut footer_bytes = [0; CHUNK_FOOTER_SIZE];
            file.seek(SeekFrom::Start(file_size - CHUNK_FOOTER_SIZE as u64))?;
            file.read_exact(&mut footer_bytes)?;

            if ChunkFooter::decode(path, &footer_bytes)?.is_completed {
                return Err(crate::Error::BadChunkInDatabase {
                    path: path.to_path_buf(),
                    reason: "chunk is completed and can not be written to".into(),
                });
            }
        }

        // NOTE: The running hash needs to cover everything that was written so far
        let mut hasher = Md5::new();
        file.seek(SeekFrom::Start(0))?;
        std::io::copy(&mut (&mut file).take(data_end), &mut hasher)?;
        file.seek(SeekFrom::Start(data_end))?;

        let appender = ChunkAppender {
            writer: BufWriter::new(file),
            hasher,
            physical_written: data_size,
        };

        Ok(Self {
            path: path.to_path_buf(),
            header,
            data_start,
            alignment_size: u64::from(alignment_size.max(1)),
            descriptor_table: FileDescriptorTable::new(path, descriptor_count)?,
            completed: RwLock::default(),
            appender: Mutex::new(Some(appender)),
            readable_size: AtomicI64::new(data_size),
            is_deleted: AtomicBool::default(),
        })
    }

    /// Returns the chunk header
    #[must_use]
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Returns the chunk file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the data region inside the file
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Returns `true` if the chunk was completed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.completed.read().expect("lock is poisoned").is_some()
    }

    /// Returns the footer of a completed chunk
    #[must_use]
    pub fn footer(&self) -> Option<ChunkFooter> {
        #[allow(clippy::expect_used)]
        self.completed
            .read()
            .expect("lock is poisoned")
            .as_ref()
            .map(|state| state.footer)
    }

    fn pos_map(&self) -> Arc<[PosMapEntry]> {
        #[allow(clippy::expect_used)]
        self.completed
            .read()
            .expect("lock is poisoned")
            .as_ref()
            .map(|state| state.pos_map.clone())
            .unwrap_or_else(|| Arc::new([]))
    }

    /// Physical data bytes visible to readers
    #[must_use]
    pub fn physical_data_size(&self) -> i64 {
        self.readable_size.load(Ordering::Acquire)
    }

    /// Logical extent of the chunk data
    #[must_use]
    pub fn logical_data_size(&self) -> i64 {
        self.footer()
            .map_or_else(|| self.physical_data_size(), |f| f.logical_data_size)
    }

    /// Marks the chunk file for deletion once the last handle is dropped
    pub fn mark_for_deletion(&self) {
        log::debug!("Marking chunk {:?} for deletion", self.path);
        self.is_deleted.store(true, Ordering::Release);
    }

    /// Returns `true` if the chunk was replaced and is about to be deleted
    #[must_use]
    pub fn is_marked_for_deletion(&self) -> bool {
        self.is_deleted.load(Ordering::Acquire)
    }

    fn check_not_deleted(&self) -> crate::Result<()> {
        if self.is_marked_for_deletion() {
            Err(crate::Error::FileBeingDeleted)
        } else {
            Ok(())
        }
    }

    /// Appends a record to the active chunk
    ///
    /// The record is buffered, it becomes visible to readers after [`Chunk::flush`].
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the chunk is completed.
    pub fn try_append(&self, record: &LogRecord) -> crate::Result<AppendResult> {
        let body = record.encode_into_vec();
        self.try_append_raw(&self.header.transform.encode(&body))
    }

    /// Appends an already transformed record body
    pub(crate) fn try_append_raw(&self, transformed: &[u8]) -> crate::Result<AppendResult> {
        #[allow(clippy::expect_used)]
        let mut lock = self.appender.lock().expect("lock is poisoned");

        let Some(appender) = lock.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("chunk {:?} is completed", self.path),
            )
            .into());
        };

        let frame_size = (transformed.len() + FRAME_OVERHEAD) as i64;
        let offset = appender.physical_written;

        if offset + frame_size > i64::from(self.header.chunk_size) {
            return Ok(AppendResult::ChunkFull);
        }

        let mut len_bytes = [0; 4];
        LittleEndian::write_u32(&mut len_bytes, transformed.len() as u32);

        appender.write_all(&len_bytes)?;
        appender.write_all(transformed)?;
        appender.write_all(&len_bytes)?;
        appender.physical_written += frame_size;

        Ok(AppendResult::Written {
            offset,
            next: offset + frame_size,
        })
    }

    /// Flushes buffered appends to disk and makes them visible to readers
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut lock = self.appender.lock().expect("lock is poisoned");

        if let Some(appender) = lock.as_mut() {
            appender.writer.flush()?;
            appender.writer.get_ref().sync_data()?;
            self.readable_size
                .store(appender.physical_written, Ordering::Release);
        }

        Ok(())
    }

    /// Completes the chunk: writes the position map, padding, footer and hash
    ///
    /// `logical_data_size` defaults to the physical data size.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the chunk is already completed.
    pub fn complete(
        &self,
        pos_map: &[PosMapEntry],
        logical_data_size: Option<i64>,
    ) -> crate::Result<ChunkFooter> {
        #[allow(clippy::expect_used)]
        let mut lock = self.appender.lock().expect("lock is poisoned");

        let Some(mut appender) = lock.take() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("chunk {:?} is already completed", self.path),
            )
            .into());
        };

        let physical = appender.physical_written;

        let mut map_bytes = Vec::with_capacity(pos_map.len() * PosMapEntry::SIZE);
        for entry in pos_map {
            entry.encode_into(&mut map_bytes)?;
        }
        appender.write_all(&map_bytes)?;

        let unaligned_end = self.data_start + physical as u64 + map_bytes.len() as u64;
        let footer_start = unaligned_end.div_ceil(self.alignment_size) * self.alignment_size;
        appender.write_all(&vec![0; (footer_start - unaligned_end) as usize])?;

        let mut footer = ChunkFooter {
            is_completed: true,
            has_pos_map: !pos_map.is_empty(),
            physical_data_size: physical as i32,
            logical_data_size: logical_data_size.unwrap_or(physical),
            map_size: map_bytes.len() as i32,
            hash: [0; CHUNK_HASH_SIZE],
        };
        appender.write_all(&footer.encode_without_hash())?;

        footer.hash = appender.hasher.finalize().into();
        appender.writer.write_all(&footer.hash)?;

        let file = appender.writer.into_inner().map_err(|e| e.into_error())?;
        file.set_len(footer_start + CHUNK_FOOTER_SIZE as u64)?;
        file.sync_all()?;

        log::debug!(
            "Completed chunk {:?}: {physical} physical bytes, {} logical bytes",
            self.path,
            footer.logical_data_size,
        );

        self.readable_size.store(physical, Ordering::Release);

        #[allow(clippy::expect_used)]
        {
            *self.completed.write().expect("lock is poisoned") = Some(CompletedState {
                footer,
                pos_map: pos_map.into(),
            });
        }

        Ok(footer)
    }

    fn read_frame(&self, physical: i64) -> crate::Result<Option<(LogRecord, i64)>> {
        let limit = self.physical_data_size();

        if physical < 0 || physical + FRAME_OVERHEAD as i64 > limit {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        self.descriptor_table
            .read_exact_at(self.data_start + physical as u64, &mut len_bytes)?;
        let length = LittleEndian::read_u32(&len_bytes);

        let frame_size = i64::from(length) + FRAME_OVERHEAD as i64;
        if physical + frame_size > limit {
            return Err(DecodeError::InvalidFrame {
                position: self.header.chunk_start_position() + physical,
                length,
            }
            .into());
        }

        let mut buf = vec![0; length as usize + 4];
        self.descriptor_table
            .read_exact_at(self.data_start + physical as u64 + 4, &mut buf)?;

        let (body, suffix) = buf.split_at(length as usize);
        if LittleEndian::read_u32(suffix) != length {
            return Err(DecodeError::InvalidFrame {
                position: self.header.chunk_start_position() + physical,
                length,
            }
            .into());
        }

        let body = self.header.transform.decode(body)?;
        let record = LogRecord::decode_from(&mut &body[..])?;

        Ok(Some((record, frame_size)))
    }

    fn read_mapped(&self, entry: Option<&PosMapEntry>) -> crate::Result<Option<ChunkRecord>> {
        let Some(entry) = entry else {
            return Ok(None);
        };

        Ok(self
            .read_frame(i64::from(entry.actual))?
            .map(|(record, length)| ChunkRecord {
                record,
                offset: i64::from(entry.logical),
                length,
            }))
    }

    /// Reads the record starting exactly at the given logical offset
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChunkScavenged`] if the chunk was scavenged and `allow_scavenged` is not set,
    /// [`crate::Error::FileBeingDeleted`] if the chunk was replaced.
    pub fn try_read_at(&self, offset: i64, allow_scavenged: bool) -> crate::Result<Option<ChunkRecord>> {
        self.check_not_deleted()?;

        if self.header.is_scavenged {
            if !allow_scavenged {
                return Err(crate::Error::ChunkScavenged(
                    self.header.chunk_start_position() + offset,
                ));
            }

            let pos_map = self.pos_map();
            let entry = pos_map
                .binary_search_by_key(&offset, |e| i64::from(e.logical))
                .ok()
                .and_then(|idx| pos_map.get(idx));

            return self.read_mapped(entry);
        }

        Ok(self
            .read_frame(offset)?
            .map(|(record, length)| ChunkRecord {
                record,
                offset,
                length,
            }))
    }

    /// Reads the first record at or after the given logical offset
    ///
    /// `offset` needs to be a record boundary unless the chunk is scavenged.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the record is damaged.
    pub fn try_read_closest_forward(&self, offset: i64) -> crate::Result<Option<ChunkRecord>> {
        self.check_not_deleted()?;

        if self.header.is_scavenged {
            let pos_map = self.pos_map();
            let idx = pos_map.partition_point(|e| i64::from(e.logical) < offset);
            return self.read_mapped(pos_map.get(idx));
        }

        self.try_read_at(offset, true)
    }

    /// Reads the last record that ends at or before the given logical offset
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the record is damaged.
    pub fn try_read_closest_backward(&self, offset: i64) -> crate::Result<Option<ChunkRecord>> {
        self.check_not_deleted()?;

        if self.header.is_scavenged {
            let pos_map = self.pos_map();
            let idx = pos_map.partition_point(|e| i64::from(e.logical) < offset);

            let Some(entry) = idx.checked_sub(1).and_then(|idx| pos_map.get(idx)) else {
                return Ok(None);
            };

            return self.read_mapped(Some(entry));
        }

        let offset = offset.min(self.physical_data_size());
        if offset < FRAME_OVERHEAD as i64 {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        self.descriptor_table
            .read_exact_at(self.data_start + offset as u64 - 4, &mut len_bytes)?;
        let length = LittleEndian::read_u32(&len_bytes);

        let start = offset - i64::from(length) - FRAME_OVERHEAD as i64;
        if start < 0 {
            return Err(DecodeError::InvalidFrame {
                position: self.header.chunk_start_position() + offset,
                length,
            }
            .into());
        }

        self.try_read_at(start, true)
    }

    /// Physical offset of the record at the given logical offset
    pub(crate) fn physical_offset_of(&self, offset: i64) -> Option<i64> {
        if !self.header.is_scavenged {
            return Some(offset);
        }

        let pos_map = self.pos_map();

        pos_map
            .binary_search_by_key(&offset, |e| i64::from(e.logical))
            .ok()
            .and_then(|idx| pos_map.get(idx))
            .map(|e| i64::from(e.actual))
    }

    /// Reads the transformed body of the frame at the given physical offset
    pub(crate) fn read_raw_frame(&self, physical: i64) -> crate::Result<Option<Vec<u8>>> {
        let limit = self.physical_data_size();

        if physical + FRAME_OVERHEAD as i64 > limit {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        self.descriptor_table
            .read_exact_at(self.data_start + physical as u64, &mut len_bytes)?;
        let length = LittleEndian::read_u32(&len_bytes);

        if physical + i64::from(length) + FRAME_OVERHEAD as i64 > limit {
            return Err(DecodeError::InvalidFrame {
                position: self.header.chunk_start_position() + physical,
                length,
            }
            .into());
        }

        let mut body = vec![0; length as usize];
        self.descriptor_table
            .read_exact_at(self.data_start + physical as u64 + 4, &mut body)?;

        Ok(Some(body))
    }

    /// Reads raw file bytes, returns the amount of bytes read
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn read_raw(&self, file_offset: u64, buf: &mut [u8]) -> crate::Result<usize> {
        self.check_not_deleted()?;
        Ok(self.descriptor_table.read_at(file_offset, buf)?)
    }

    /// Reads bytes of the data region, bounded by the visible data size
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn read_data(&self, data_offset: i64, buf: &mut [u8]) -> crate::Result<usize> {
        self.check_not_deleted()?;

        let remaining = (self.physical_data_size() - data_offset).max(0) as usize;
        let len = remaining.min(buf.len());

        #[allow(clippy::indexing_slicing)]
        let read = self
            .descriptor_table
            .read_at(self.data_start + data_offset as u64, &mut buf[..len])?;

        Ok(read)
    }

    /// Size of the chunk file on disk
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn file_size(&self) -> crate::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.is_marked_for_deletion() {
            log::trace!("Deleting chunk file {:?}", self.path);

            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to delete chunk file {:?}: {e:?}", self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{naming::ChunkFileName, transform::ChunkTransform, *};
    use crate::{record::PrepareLogRecord, version::Version};
    use byteorder::WriteBytesExt;
    use test_log::test;

    fn header(transform: ChunkTransform) -> ChunkHeader {
        ChunkHeader {
            version: Version::CURRENT,
            chunk_size: 4_096,
            chunk_start_number: 0,
            chunk_end_number: 0,
            is_scavenged: false,
            transform,
        }
    }

    fn prepare(position: i64, stream: &str) -> LogRecord {
        LogRecord::Prepare(PrepareLogRecord::single_write(
            position, stream, -1, "type", b"data", b"",
        ))
    }

    fn append_all(chunk: &Chunk, count: usize) -> crate::Result<Vec<i64>> {
        let mut offsets = vec![];
        let mut position = 0;

        for idx in 0..count {
            match chunk.try_append(&prepare(position, &format!("stream-{idx}")))? {
                AppendResult::Written { offset, next } => {
                    offsets.push(offset);
                    position = next;
                }
                AppendResult::ChunkFull => break,
            }
        }

        Ok(offsets)
    }

    #[test]
    fn chunk_append_flush_read() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join(ChunkFileName { number: 0, version: 0 }.file_name());

        let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 1, 2)?;
        let offsets = append_all(&chunk, 3)?;

        // Not visible before flush
        assert_eq!(None, chunk.try_read_at(0, false)?);

        chunk.flush()?;

        for (idx, offset) in offsets.iter().enumerate() {
            let record = chunk.try_read_at(*offset, false)?.expect("should exist");
            match record.record {
                LogRecord::Prepare(p) => assert_eq!(format!("stream-{idx}"), p.event_stream_id),
                LogRecord::Commit(_) => panic!("unexpected commit"),
            }
        }

        let last = chunk
            .try_read_closest_backward(chunk.physical_data_size())?
            .expect("should exist");
        assert_eq!(offsets[2], last.offset);

        let first = chunk.try_read_closest_backward(offsets[1])?.expect("should exist");
        assert_eq!(0, first.offset);
        assert_eq!(offsets[1], first.next_offset());

        assert_eq!(None, chunk.try_read_closest_backward(0)?);

        Ok(())
    }

    #[test]
    fn chunk_full() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 1, 1)?;
        let offsets = append_all(&chunk, 10_000)?;

        assert!(!offsets.is_empty());
        assert!(offsets.len() < 10_000);
        assert!(matches!(
            chunk.try_append(&prepare(0, "x"))?,
            AppendResult::ChunkFull
        ));

        Ok(())
    }

    #[test]
    fn chunk_complete_and_reopen() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        {
            let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 512, 1)?;
            append_all(&chunk, 5)?;
            let footer = chunk.complete(&[], None)?;

            assert!(footer.is_completed);
            assert_eq!(i64::from(footer.physical_data_size), footer.logical_data_size);

            let file_size = chunk.file_size()?;
            assert_eq!(0, (file_size - CHUNK_FOOTER_SIZE as u64) % 512);

            assert!(chunk.try_append(&prepare(0, "x")).is_err());
        }

        let chunk = Chunk::open_completed(&path, true, 1)?;
        assert!(chunk.is_completed());
        assert!(chunk.try_read_at(0, false)?.is_some());

        Ok(())
    }

    #[test]
    fn chunk_hash_mismatch() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        {
            let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 1, 1)?;
            append_all(&chunk, 5)?;
            chunk.complete(&[], None)?;
        }

        {
            let mut file = File::options().write(true).open(&path)?;
            file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + 20))?;
            file.write_u8(0xFF)?;
            file.sync_all()?;
        }

        assert!(matches!(
            Chunk::open_completed(&path, true, 1),
            Err(crate::Error::HashValidation(_))
        ));

        // Not verifying succeeds
        Chunk::open_completed(&path, false, 1)?;

        Ok(())
    }

    #[test]
    fn chunk_reopen_active() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        let data_size = {
            let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 1, 1)?;
            append_all(&chunk, 2)?;
            chunk.flush()?;
            chunk.physical_data_size()
        };

        {
            let chunk = Chunk::open_active(&path, data_size, 1, 1)?;
            assert!(!chunk.is_completed());

            let AppendResult::Written { offset, .. } = chunk.try_append(&prepare(data_size, "c"))?
            else {
                panic!("should fit");
            };
            assert_eq!(data_size, offset);

            chunk.complete(&[], None)?;
        }

        // Hash covers the bytes written before and after reopening
        let chunk = Chunk::open_completed(&path, true, 1)?;
        assert_eq!(None, chunk.try_read_closest_forward(chunk.physical_data_size())?);

        Ok(())
    }

    #[test]
    fn chunk_open_active_completed_fails() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        {
            let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 1, 1)?;
            append_all(&chunk, 2)?;
            chunk.complete(&[], None)?;
        }

        assert!(matches!(
            Chunk::open_active(&path, 0, 1, 1),
            Err(crate::Error::BadChunkInDatabase { .. })
        ));

        Ok(())
    }

    #[test]
    fn chunk_marked_for_deletion() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        let chunk = Chunk::create(&path, header(ChunkTransform::Identity), 1, 1)?;
        append_all(&chunk, 1)?;
        chunk.flush()?;

        chunk.mark_for_deletion();
        assert!(matches!(
            chunk.try_read_at(0, false),
            Err(crate::Error::FileBeingDeleted)
        ));
        assert!(path.try_exists()?);

        drop(chunk);
        assert!(!path.try_exists()?);

        Ok(())
    }

    #[test]
    #[cfg(feature = "lz4")]
    fn chunk_lz4_transform() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("chunk");

        let record = LogRecord::Prepare(PrepareLogRecord::single_write(
            0,
            "stream",
            -1,
            "type",
            &[b'a'; 1_000],
            b"",
        ));

        {
            let chunk = Chunk::create(&path, header(ChunkTransform::Lz4), 1, 1)?;
            let AppendResult::Written { next, .. } = chunk.try_append(&record)? else {
                panic!("should fit");
            };
            assert!(next < 1_000);
            chunk.complete(&[], None)?;
        }

        let chunk = Chunk::open_completed(&path, true, 1)?;
        assert_eq!(
            CHUNK_HEADER_SIZE as u64 + ChunkTransform::Lz4.header_size() as u64,
            chunk.data_start()
        );
        assert_eq!(record, chunk.try_read_at(0, false)?.expect("should exist").record);

        Ok(())
    }
}
