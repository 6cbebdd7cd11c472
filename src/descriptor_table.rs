// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

/// A small set of read-only file handles for one file,
/// so concurrent readers rarely contend on a single seek position
pub struct FileDescriptorTable {
    files: Vec<Mutex<File>>,
    next: AtomicUsize,
}

impl FileDescriptorTable {
    pub fn new<P: AsRef<Path>>(path: P, count: usize) -> std::io::Result<Self> {
        let files = (0..count.max(1))
            .map(|_| File::open(&path).map(Mutex::new))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            files,
            next: AtomicUsize::default(),
        })
    }

    fn access(&self) -> MutexGuard<'_, File> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        for offset in 0..self.files.len() {
            let idx = (start + offset) % self.files.len();

            if let Some(Ok(guard)) = self.files.get(idx).map(Mutex::try_lock) {
                return guard;
            }
        }

        let idx = start % self.files.len();

        #[allow(clippy::expect_used)]
        self.files
            .get(idx)
            .expect("should exist")
            .lock()
            .expect("lock is poisoned")
    }

    /// Fills `buf` with the bytes starting at `offset`
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = self.access();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returns the amount of bytes read
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = self.access();
        file.seek(SeekFrom::Start(offset))?;

        let mut read = 0;
        while read < buf.len() {
            #[allow(clippy::indexing_slicing)]
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }

        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn descriptor_table_reads() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("file");
        std::fs::write(&path, b"0123456789")?;

        let table = FileDescriptorTable::new(&path, 4)?;

        let mut buf = [0; 3];
        table.read_exact_at(2, &mut buf)?;
        assert_eq!(b"234", &buf);

        let mut buf = [0; 8];
        assert_eq!(3, table.read_at(7, &mut buf)?);
        assert_eq!(b"789", &buf[..3]);

        Ok(())
    }
}
