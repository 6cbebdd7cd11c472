// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    entry::{IndexEntry, IndexKey},
    midpoint::{required_midpoint_count, Midpoint, MidpointIndexCalculator},
};
use crate::{
    descriptor_table::FileDescriptorTable,
    error::{CorruptIndexError, InvalidFileError},
    file::{fsync_directory, PTABLE_FILE_EXT},
    stop_signal::StopSignal,
    version::{parse_file_header, write_file_header, FileType, HeaderError, Version},
};
use byteorder::{ByteOrder, LittleEndian};
use md5::{Digest, Md5};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

pub const PTABLE_HEADER_SIZE: usize = 128;
pub const PTABLE_FOOTER_SIZE: usize = 128;
pub const PTABLE_HASH_SIZE: usize = 16;

/// Below this amount of candidate entries, lookups read the candidates at once
/// instead of continuing the binary search on disk
const SCAN_THRESHOLD: u64 = 128;

const STOP_CHECK_INTERVAL: u64 = 4_096;

/// File name of the table with the given ID
#[must_use]
pub fn table_file_name(id: u64) -> String {
    format!("{id}.{PTABLE_FILE_EXT}")
}

/// Parses the table ID of a table file name
#[must_use]
pub fn parse_table_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_suffix(PTABLE_FILE_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

fn corrupt_file(path: &Path, reason: String) -> crate::Error {
    crate::Error::CorruptIndex(CorruptIndexError::InvalidFile(InvalidFileError {
        path: path.to_path_buf(),
        reason,
    }))
}

fn parse_table_header(path: &Path, bytes: &[u8]) -> crate::Result<Version> {
    parse_file_header(bytes, FileType::PTable).map_err(|e| match e {
        HeaderError::FileType(tag) => {
            corrupt_file(path, format!("unknown file type marker {tag}"))
        }
        HeaderError::Version(version) => crate::Error::UnsupportedFileVersion {
            path: path.to_path_buf(),
            version,
        },
    })
}

/// Immutable, sorted index file
///
/// Layout:
///
/// \[header; 128\]
/// \[entries; 24 * n\]
/// \[midpoints; 24 * m\]
/// \[footer; 128\]
/// \[md5; 16\]
///
/// Entries are stored in table order (descending by stream hash, then event number).
/// The MD5 covers every byte before it.
pub struct PTable {
    id: u64,
    path: PathBuf,
    version: Version,
    entry_count: u64,
    midpoints: Box<[Midpoint]>,
    descriptor_table: FileDescriptorTable,
    is_deleted: AtomicBool,
}

impl std::fmt::Debug for PTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PTable:{}({} entries)", self.id, self.entry_count)
    }
}

impl PTable {
    /// Writes a new table from entries given in table order
    ///
    /// The table is written to a temporary file first and moved into place
    /// once it is complete and durable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Cancelled`] if the stop signal was sent, in which case
    /// no file is left behind.
    #[allow(clippy::indexing_slicing)]
    pub fn write<P: AsRef<Path>, I: IntoIterator<Item = crate::Result<IndexEntry>>>(
        path: P,
        entries: I,
        cache_depth: u32,
        stop_signal: &StopSignal,
    ) -> crate::Result<()> {
        let path = path.as_ref();

        #[allow(clippy::expect_used)]
        let folder = path.parent().expect("should have a parent");

        log::debug!("Writing table {path:?}");
        let start = std::time::Instant::now();

        let temp_file = tempfile::NamedTempFile::new_in(folder)?;
        let mut writer = BufWriter::new(temp_file.as_file());
        let mut hasher = Md5::new();

        let mut header = [0; PTABLE_HEADER_SIZE];
        write_file_header(&mut &mut header[..], FileType::PTable, Version::CURRENT)?;
        writer.write_all(&header)?;
        hasher.update(header);

        let mut entry_count = 0u64;
        let mut last_key: Option<IndexKey> = None;
        let mut buf = Vec::with_capacity(IndexEntry::SIZE);

        for entry in entries {
            let entry = entry?;

            if let Some(last_key) = last_key {
                debug_assert!(last_key < entry.key(), "entries should be in table order");
            }
            last_key = Some(entry.key());

            buf.clear();
            entry.encode_into(&mut buf)?;
            writer.write_all(&buf)?;
            hasher.update(&buf);

            entry_count += 1;

            if entry_count % STOP_CHECK_INTERVAL == 0 && stop_signal.is_stopped() {
                log::debug!("Writing table {path:?} was cancelled");
                return Err(crate::Error::Cancelled);
            }
        }

        writer.flush()?;

        // NOTE: Midpoint keys are read back from the entries we just wrote
        let midpoint_count = required_midpoint_count(entry_count, cache_depth);
        let mut entry_reader = temp_file.reopen()?;
        let mut entry_buf = [0; IndexEntry::SIZE];

        for index in MidpointIndexCalculator::new(entry_count, midpoint_count) {
            entry_reader.seek(SeekFrom::Start(
                PTABLE_HEADER_SIZE as u64 + index * IndexEntry::SIZE as u64,
            ))?;
            entry_reader.read_exact(&mut entry_buf)?;
            let entry = IndexEntry::decode_from(&mut &entry_buf[..])?;

            buf.clear();
            encode_midpoint(
                &Midpoint {
                    key: entry.key(),
                    index,
                },
                &mut buf,
            );
            writer.write_all(&buf)?;
            hasher.update(&buf);
        }

        let mut footer = [0; PTABLE_FOOTER_SIZE];
        write_file_header(&mut &mut footer[..], FileType::PTable, Version::CURRENT)?;

        // NOTE: The midpoint count is bounded by 2^28
        #[allow(clippy::cast_possible_truncation)]
        LittleEndian::write_u32(&mut footer[2..6], midpoint_count as u32);
        LittleEndian::write_u64(&mut footer[6..14], entry_count);
        writer.write_all(&footer)?;
        hasher.update(footer);

        writer.write_all(&hasher.finalize())?;
        writer.flush()?;
        drop(writer);

        temp_file.as_file().sync_all()?;
        temp_file.persist(path).map_err(|e| e.error)?;

        // IMPORTANT: fsync folder on Unix
        fsync_directory(folder)?;

        log::debug!(
            "Written table {path:?} with {entry_count} entries, {midpoint_count} midpoints in {}ms",
            start.elapsed().as_millis()
        );

        Ok(())
    }

    /// Opens a table file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorruptIndex`] if the file is not a table or its hash does not match,
    /// [`crate::Error::UnsupportedFileVersion`] or [`crate::Error::WrongFileVersion`] on version problems.
    pub fn open<P: AsRef<Path>>(
        path: P,
        id: u64,
        verify_hash: bool,
        descriptor_count: usize,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        log::trace!("Opening table {path:?}");

        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut header = [0; PTABLE_HEADER_SIZE];
        let header_read = file.read(&mut header)?;
        #[allow(clippy::indexing_slicing)]
        let version = parse_table_header(path, &header[..header_read])?;

        let min_size = (PTABLE_HEADER_SIZE + PTABLE_FOOTER_SIZE + PTABLE_HASH_SIZE) as u64;
        if file_size < min_size {
            return Err(corrupt_file(
                path,
                format!("file size {file_size} is smaller than {min_size}"),
            ));
        }

        let mut footer = [0; PTABLE_FOOTER_SIZE];
        file.seek(SeekFrom::Start(
            file_size - (PTABLE_FOOTER_SIZE + PTABLE_HASH_SIZE) as u64,
        ))?;
        file.read_exact(&mut footer)?;

        match parse_file_header(&footer, FileType::PTable) {
            Ok(footer_version) if footer_version == version => {}
            Ok(footer_version) => {
                return Err(crate::Error::WrongFileVersion {
                    path: path.to_path_buf(),
                    expected: version.into(),
                    actual: footer_version.into(),
                });
            }
            Err(HeaderError::FileType(tag)) => {
                return Err(corrupt_file(path, format!("unknown footer marker {tag}")));
            }
            Err(HeaderError::Version(actual)) => {
                return Err(crate::Error::WrongFileVersion {
                    path: path.to_path_buf(),
                    expected: version.into(),
                    actual,
                });
            }
        }

        #[allow(clippy::indexing_slicing)]
        let midpoint_count = u64::from(LittleEndian::read_u32(&footer[2..6]));
        #[allow(clippy::indexing_slicing)]
        let entry_count = LittleEndian::read_u64(&footer[6..14]);

        let expected_size = entry_count
            .checked_add(midpoint_count)
            .and_then(|n| n.checked_mul(IndexEntry::SIZE as u64))
            .and_then(|n| n.checked_add(min_size));

        if expected_size != Some(file_size) {
            return Err(corrupt_file(
                path,
                format!(
                    "{entry_count} entries and {midpoint_count} midpoints do not fit file size {file_size}"
                ),
            ));
        }

        if verify_hash {
            verify_file_hash(path, &mut file, file_size)?;
        }

        file.seek(SeekFrom::Start(
            PTABLE_HEADER_SIZE as u64 + entry_count * IndexEntry::SIZE as u64,
        ))?;
        let mut reader = BufReader::new(&mut file);
        let mut midpoints: Vec<Midpoint> = Vec::with_capacity(midpoint_count as usize);

        for _ in 0..midpoint_count {
            let midpoint = decode_midpoint(&mut reader)?;

            if let Some(last) = midpoints.last() {
                if last.index > midpoint.index || last.key > midpoint.key {
                    return Err(crate::Error::CorruptIndex(CorruptIndexError::MaybeCorrupt {
                        path: path.to_path_buf(),
                        reason: "midpoints are out of order".into(),
                    }));
                }
            }

            if midpoint.index >= entry_count {
                return Err(crate::Error::CorruptIndex(CorruptIndexError::MaybeCorrupt {
                    path: path.to_path_buf(),
                    reason: format!("midpoint index {} is out of bounds", midpoint.index),
                }));
            }

            midpoints.push(midpoint);
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            version,
            entry_count,
            midpoints: midpoints.into_boxed_slice(),
            descriptor_table: FileDescriptorTable::new(path, descriptor_count)?,
            is_deleted: AtomicBool::default(),
        })
    }

    /// Table ID
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path of the table file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the table, as stored in the index map
    #[must_use]
    pub fn file_name(&self) -> String {
        table_file_name(self.id)
    }

    /// Disk format version
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Amount of entries in the table
    #[must_use]
    pub fn count(&self) -> u64 {
        self.entry_count
    }

    /// Cached midpoints
    #[must_use]
    pub fn midpoints(&self) -> &[Midpoint] {
        &self.midpoints
    }

    /// Deletes the table file once the last reference is dropped
    pub fn mark_for_deletion(&self) {
        self.is_deleted.store(true, Ordering::Release);
    }

    fn maybe_corrupt(&self, reason: String) -> crate::Error {
        crate::Error::CorruptIndex(CorruptIndexError::MaybeCorrupt {
            path: self.path.clone(),
            reason,
        })
    }

    fn read_entries(&self, start: u64, count: u64) -> crate::Result<Vec<IndexEntry>> {
        let mut buf = vec![0; (count as usize) * IndexEntry::SIZE];
        self.descriptor_table.read_exact_at(
            PTABLE_HEADER_SIZE as u64 + start * IndexEntry::SIZE as u64,
            &mut buf,
        )?;

        buf.chunks_exact(IndexEntry::SIZE)
            .map(|mut bytes| IndexEntry::decode_from(&mut bytes).map_err(Into::into))
            .collect()
    }

    fn read_entry(&self, index: u64) -> crate::Result<IndexEntry> {
        self.read_entries(index, 1)?
            .pop()
            .ok_or_else(|| self.maybe_corrupt(format!("entry {index} could not be read")))
    }

    /// Returns the index of the first entry whose key does not satisfy `pred`
    ///
    /// `pred` needs to hold for a prefix of the table (in table order).
    fn partition_point<F: Fn(&IndexKey) -> bool>(&self, pred: F) -> crate::Result<u64> {
        let p = self.midpoints.partition_point(|m| pred(&m.key));

        let (Some(low), Some(high)) = (
            p.checked_sub(1).and_then(|idx| self.midpoints.get(idx)),
            self.midpoints.get(p),
        ) else {
            return Ok(if p == 0 { 0 } else { self.entry_count });
        };

        // NOTE: pred(entry[low]) holds, pred(entry[high]) does not
        let (mut low, mut high) = (low.index, high.index);

        while high - low > SCAN_THRESHOLD {
            let mid = low + (high - low) / 2;

            if pred(&self.read_entry(mid)?.key()) {
                low = mid;
            } else {
                high = mid;
            }
        }

        let candidates = self.read_entries(low + 1, high - low)?;
        let mut last_key: Option<IndexKey> = None;

        for (offset, entry) in (low + 1..).zip(&candidates) {
            if let Some(last_key) = last_key {
                if last_key >= entry.key() {
                    return Err(self.maybe_corrupt(format!(
                        "entry {offset} is out of order: {last_key:?} >= {:?}",
                        entry.key()
                    )));
                }
            }
            last_key = Some(entry.key());

            if !pred(&entry.key()) {
                return Ok(offset);
            }
        }

        Err(self.maybe_corrupt(format!(
            "no entry in [{}, {high}] matches the midpoint bounds",
            low + 1
        )))
    }

    /// Returns the log position of the given event
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the table is corrupt.
    pub fn get(&self, stream: u64, version: i64) -> crate::Result<Option<i64>> {
        let key = IndexKey::new(stream, version);
        let index = self.partition_point(|k| *k < key)?;

        if index >= self.entry_count {
            return Ok(None);
        }

        let entry = self.read_entry(index)?;
        Ok((entry.key() == key).then_some(entry.position))
    }

    /// Returns the entry with the highest event number of the stream
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the table is corrupt.
    pub fn try_get_latest(&self, stream: u64) -> crate::Result<Option<IndexEntry>> {
        let key = IndexKey::first_of(stream);
        let index = self.partition_point(|k| *k < key)?;

        if index >= self.entry_count {
            return Ok(None);
        }

        let entry = self.read_entry(index)?;
        Ok((entry.stream == stream).then_some(entry))
    }

    /// Returns the entry with the lowest event number of the stream
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the table is corrupt.
    pub fn try_get_oldest(&self, stream: u64) -> crate::Result<Option<IndexEntry>> {
        let key = IndexKey::last_of(stream);
        let index = self.partition_point(|k| *k <= key)?;

        let Some(index) = index.checked_sub(1) else {
            return Ok(None);
        };

        let entry = self.read_entry(index)?;
        Ok((entry.stream == stream).then_some(entry))
    }

    /// Returns up to `limit` entries of the stream with `from <= version <= to`,
    /// highest event number first
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the table is corrupt.
    pub fn get_range(
        &self,
        stream: u64,
        from: i64,
        to: i64,
        limit: usize,
    ) -> crate::Result<Vec<IndexEntry>> {
        if from > to || limit == 0 {
            return Ok(vec![]);
        }

        let start_key = IndexKey::new(stream, to);
        let end_key = IndexKey::new(stream, from);

        let mut index = self.partition_point(|k| *k < start_key)?;
        let mut result = vec![];
        let mut last_key: Option<IndexKey> = None;

        while index < self.entry_count && result.len() < limit {
            let batch_size = (self.entry_count - index).min(SCAN_THRESHOLD);

            for entry in self.read_entries(index, batch_size)? {
                if let Some(last_key) = last_key {
                    if last_key >= entry.key() {
                        return Err(self.maybe_corrupt(format!(
                            "entries are out of order: {last_key:?} >= {:?}",
                            entry.key()
                        )));
                    }
                }
                last_key = Some(entry.key());

                if entry.key() > end_key {
                    return Ok(result);
                }

                result.push(entry);

                if result.len() >= limit {
                    return Ok(result);
                }
            }

            index += batch_size;
        }

        Ok(result)
    }

    /// Iterates over all entries in table order
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn iter(&self) -> crate::Result<PTableIter> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(PTABLE_HEADER_SIZE as u64))?;

        Ok(PTableIter {
            reader: BufReader::new(file),
            remaining: self.entry_count,
        })
    }
}

impl Drop for PTable {
    fn drop(&mut self) {
        if self.is_deleted.load(Ordering::Acquire) {
            log::trace!("Deleting table file {:?}", self.path);

            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to delete table file {:?}: {e:?}", self.path);
            }
        }
    }
}

/// Sequential reader over the entries of a table
pub struct PTableIter {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for PTableIter {
    type Item = crate::Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        Some(IndexEntry::decode_from(&mut self.reader).map_err(Into::into))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

#[allow(clippy::indexing_slicing)]
fn encode_midpoint(midpoint: &Midpoint, buf: &mut Vec<u8>) {
    let mut bytes = [0; IndexEntry::SIZE];
    LittleEndian::write_u64(&mut bytes[0..8], midpoint.key.stream);
    LittleEndian::write_i64(&mut bytes[8..16], midpoint.key.version);
    LittleEndian::write_u64(&mut bytes[16..24], midpoint.index);

    buf.extend_from_slice(&bytes);
}

#[allow(clippy::indexing_slicing)]
fn decode_midpoint<R: Read>(reader: &mut R) -> std::io::Result<Midpoint> {
    let mut bytes = [0; IndexEntry::SIZE];
    reader.read_exact(&mut bytes)?;

    Ok(Midpoint {
        key: IndexKey::new(
            LittleEndian::read_u64(&bytes[0..8]),
            LittleEndian::read_i64(&bytes[8..16]),
        ),
        index: LittleEndian::read_u64(&bytes[16..24]),
    })
}

fn verify_file_hash(path: &Path, file: &mut File, file_size: u64) -> crate::Result<()> {
    let content_size = file_size - PTABLE_HASH_SIZE as u64;

    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Md5::new();
    std::io::copy(&mut (&mut *file).take(content_size), &mut hasher)?;

    let mut stored = [0; PTABLE_HASH_SIZE];
    file.read_exact(&mut stored)?;

    if hasher.finalize().as_slice() != stored {
        log::error!("Hash validation of table {path:?} failed");

        return Err(crate::Error::CorruptIndex(
            CorruptIndexError::HashValidation {
                path: path.to_path_buf(),
            },
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn write_table(
        folder: &Path,
        id: u64,
        entries: &[IndexEntry],
        cache_depth: u32,
    ) -> crate::Result<PTable> {
        let path = folder.join(table_file_name(id));
        PTable::write(
            &path,
            entries.iter().copied().map(Ok),
            cache_depth,
            &StopSignal::default(),
        )?;
        PTable::open(&path, id, true, 1)
    }

    fn sorted(mut entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
        entries.sort_by_key(IndexEntry::key);
        entries
    }

    #[test]
    fn ptable_file_name() {
        assert_eq!("12.ptable", table_file_name(12));
        assert_eq!(Some(12), parse_table_id("12.ptable"));
        assert_eq!(None, parse_table_id("12ptable"));
        assert_eq!(None, parse_table_id("abc.ptable"));
        assert_eq!(None, parse_table_id("12.tmp"));
    }

    #[test]
    fn ptable_empty() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let table = write_table(folder.path(), 0, &[], 16)?;

        assert_eq!(0, table.count());
        assert!(table.midpoints().is_empty());
        assert_eq!(None, table.get(1, 0)?);
        assert_eq!(None, table.try_get_latest(1)?);
        assert_eq!(None, table.try_get_oldest(1)?);
        assert_eq!(0, table.iter()?.count());

        Ok(())
    }

    #[test]
    fn ptable_single_entry() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let table = write_table(folder.path(), 0, &[IndexEntry::new(5, 3, 100)], 16)?;

        assert_eq!(2, table.midpoints().len());
        assert_eq!(Some(100), table.get(5, 3)?);
        assert_eq!(None, table.get(5, 2)?);
        assert_eq!(None, table.get(4, 3)?);
        assert_eq!(Some(IndexEntry::new(5, 3, 100)), table.try_get_latest(5)?);
        assert_eq!(Some(IndexEntry::new(5, 3, 100)), table.try_get_oldest(5)?);
        assert_eq!(None, table.try_get_latest(6)?);

        Ok(())
    }

    #[test]
    fn ptable_lookups() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        let entries = sorted(
            (0..50u64)
                .flat_map(|stream| {
                    (0..100i64).map(move |version| {
                        IndexEntry::new(stream * 3, version, (stream as i64) * 1_000 + version)
                    })
                })
                .collect(),
        );

        // Shallow midpoint cache forces on-disk binary searches
        for depth in [1, 4, 16] {
            let table = write_table(folder.path(), u64::from(depth), &entries, depth)?;
            assert_eq!(5_000, table.count());

            for stream in 0..50u64 {
                let hash = stream * 3;
                let base = (stream as i64) * 1_000;

                assert_eq!(Some(base), table.get(hash, 0)?);
                assert_eq!(Some(base + 57), table.get(hash, 57)?);
                assert_eq!(None, table.get(hash, 100)?);
                assert_eq!(None, table.get(hash + 1, 0)?);

                assert_eq!(
                    Some(IndexEntry::new(hash, 99, base + 99)),
                    table.try_get_latest(hash)?
                );
                assert_eq!(
                    Some(IndexEntry::new(hash, 0, base)),
                    table.try_get_oldest(hash)?
                );
                assert_eq!(None, table.try_get_latest(hash + 1)?);
                assert_eq!(None, table.try_get_oldest(hash + 2)?);
            }
        }

        Ok(())
    }

    #[test]
    fn ptable_range() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        let entries = sorted(
            (0..3u64)
                .flat_map(|stream| (0..500i64).map(move |v| IndexEntry::new(stream, v, v)))
                .collect(),
        );
        let table = write_table(folder.path(), 0, &entries, 2)?;

        let range = table.get_range(1, 10, 400, usize::MAX)?;
        assert_eq!(391, range.len());
        assert_eq!(400, range.first().map(|e| e.version).unwrap_or_default());
        assert_eq!(10, range.last().map(|e| e.version).unwrap_or_default());
        assert!(range.iter().all(|e| e.stream == 1));

        let range = table.get_range(1, 10, 400, 5)?;
        assert_eq!(
            vec![400, 399, 398, 397, 396],
            range.iter().map(|e| e.version).collect::<Vec<_>>()
        );

        assert!(table.get_range(1, 400, 10, 10)?.is_empty());
        assert!(table.get_range(7, 0, 10, 10)?.is_empty());

        Ok(())
    }

    #[test]
    fn ptable_iter_in_table_order() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        let entries = sorted((0..1_000).map(|v| IndexEntry::new(v % 7, v as i64, 0)).collect());
        let table = write_table(folder.path(), 0, &entries, 16)?;

        assert_eq!(entries, table.iter()?.collect::<crate::Result<Vec<_>>>()?);

        Ok(())
    }

    #[test]
    fn ptable_hash_mismatch() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join(table_file_name(0));

        PTable::write(
            &path,
            (0..10).map(|v| Ok(IndexEntry::new(1, 10 - v, 0))),
            16,
            &StopSignal::default(),
        )?;

        {
            let mut file = File::options().write(true).open(&path)?;
            file.seek(SeekFrom::Start(PTABLE_HEADER_SIZE as u64 + 20))?;
            file.write_all(&[0xFF])?;
        }

        // Hash is only checked when asked for
        assert!(PTable::open(&path, 0, false, 1).is_ok());

        assert!(matches!(
            PTable::open(&path, 0, true, 1),
            Err(crate::Error::CorruptIndex(CorruptIndexError::HashValidation { .. }))
        ));

        Ok(())
    }

    #[test]
    fn ptable_invalid_header() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join(table_file_name(0));

        PTable::write(&path, std::iter::empty(), 16, &StopSignal::default())?;

        {
            let mut file = File::options().write(true).open(&path)?;
            file.write_all(&[7])?;
        }

        assert!(matches!(
            PTable::open(&path, 0, false, 1),
            Err(crate::Error::CorruptIndex(CorruptIndexError::InvalidFile(_)))
        ));

        {
            let mut file = File::options().write(true).open(&path)?;
            file.write_all(&[u8::from(FileType::PTable), 99])?;
        }

        assert!(matches!(
            PTable::open(&path, 0, false, 1),
            Err(crate::Error::UnsupportedFileVersion { version: 99, .. })
        ));

        Ok(())
    }

    #[test]
    fn ptable_wrong_footer_version() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join(table_file_name(0));

        PTable::write(&path, std::iter::empty(), 16, &StopSignal::default())?;

        {
            let mut file = File::options().write(true).open(&path)?;
            file.seek(SeekFrom::Start((PTABLE_HEADER_SIZE + 1) as u64))?;
            file.write_all(&[2])?;
        }

        assert!(matches!(
            PTable::open(&path, 0, false, 1),
            Err(crate::Error::WrongFileVersion {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        Ok(())
    }

    #[test]
    fn ptable_write_cancelled() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join(table_file_name(0));

        let stop_signal = StopSignal::default();
        stop_signal.send();

        let result = PTable::write(
            &path,
            (0..10_000).map(|v| Ok(IndexEntry::new(1, 10_000 - v, 0))),
            16,
            &stop_signal,
        );

        assert!(matches!(result, Err(crate::Error::Cancelled)));
        assert!(!path.try_exists()?);
        assert_eq!(0, std::fs::read_dir(folder.path())?.count());

        Ok(())
    }

    #[test]
    fn ptable_marked_for_deletion() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let table = write_table(folder.path(), 0, &[IndexEntry::new(1, 0, 0)], 16)?;
        let path = table.path().to_path_buf();

        table.mark_for_deletion();
        assert!(path.try_exists()?);

        drop(table);
        assert!(!path.try_exists()?);

        Ok(())
    }
}
