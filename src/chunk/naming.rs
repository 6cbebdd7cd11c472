// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::{Path, PathBuf};

const CHUNK_FILE_PREFIX: &str = "chunk-";

/// Number and version parsed from a chunk file name
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChunkFileName {
    /// Chunk number
    pub number: u32,

    /// Chunk version, increased whenever the chunk is rewritten
    pub version: u32,
}

impl ChunkFileName {
    /// Formats the file name, e.g. `chunk-000012.000001`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{CHUNK_FILE_PREFIX}{:06}.{:06}", self.number, self.version)
    }

    /// Parses a chunk file name, returns `None` for unrelated files
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(CHUNK_FILE_PREFIX)?;
        let (number, version) = rest.split_once('.')?;

        if number.len() < 6 || version.len() < 6 {
            return None;
        }

        Some(Self {
            number: number.parse().ok()?,
            version: version.parse().ok()?,
        })
    }
}

/// Lists all chunk files in a folder, sorted by (number, version)
pub fn list_chunk_files<P: AsRef<Path>>(folder: P) -> std::io::Result<Vec<(ChunkFileName, PathBuf)>> {
    let mut files = vec![];

    for dirent in std::fs::read_dir(folder)? {
        let dirent = dirent?;

        if !dirent.file_type()?.is_file() {
            continue;
        }

        let file_name = dirent.file_name();
        let Some(name) = file_name.to_str().and_then(ChunkFileName::parse) else {
            continue;
        };

        files.push((name, dirent.path()));
    }

    files.sort_by(|(a, _), (b, _)| a.cmp(b));

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn chunk_file_name() {
        let name = ChunkFileName {
            number: 12,
            version: 1,
        };
        assert_eq!("chunk-000012.000001", name.file_name());
        assert_eq!(Some(name), ChunkFileName::parse(&name.file_name()));
    }

    #[test]
    fn chunk_file_name_invalid() {
        assert_eq!(None, ChunkFileName::parse("writer.chk"));
        assert_eq!(None, ChunkFileName::parse("chunk-12.1"));
        assert_eq!(None, ChunkFileName::parse("chunk-000012"));
        assert_eq!(None, ChunkFileName::parse("chunk-00001a.000000"));
    }

    #[test]
    fn list_chunk_files_sorted() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        for name in [
            "chunk-000001.000000",
            "chunk-000000.000001",
            "chunk-000000.000000",
            "writer.chk",
        ] {
            std::fs::write(folder.path().join(name), b"")?;
        }

        let files = list_chunk_files(folder.path())?
            .into_iter()
            .map(|(name, _)| (name.number, name.version))
            .collect::<Vec<_>>();

        assert_eq!(vec![(0, 0), (0, 1), (1, 0)], files);

        Ok(())
    }
}
