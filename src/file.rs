// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{fs::File, io::Write, path::Path};

pub const CHECKPOINT_FILE_EXT: &str = "chk";
pub const INDEX_FOLDER: &str = "index";
pub const INDEX_MAP_FILE: &str = "indexmap";
pub const PTABLE_FILE_EXT: &str = "ptable";
pub const TEMP_FILE_EXT: &str = "tmp";

/// Atomically rewrites a file
pub fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();

    #[allow(clippy::expect_used)]
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;

    temp_file.persist(path).map_err(|e| e.error)?;

    // IMPORTANT: fsync folder on Unix
    fsync_directory(folder)?;

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory<P: AsRef<Path>>(_path: P) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use test_log::test;

    #[test]
    fn atomic_rewrite() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = dir.path().join("test.txt");
        let mut file = File::create(&path)?;
        write!(file, "asdasdasdasdasd")?;

        rewrite_atomic(&path, b"newcontent")?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!("newcontent", content);

        Ok(())
    }

    #[test]
    fn atomic_rewrite_creates_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fresh");

        rewrite_atomic(&path, b"abc")?;
        assert_eq!(b"abc", &*std::fs::read(&path)?);

        // no temporary files are left behind
        assert_eq!(1, std::fs::read_dir(dir.path())?.count());

        Ok(())
    }
}
