// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    merge::{BoxedIterator, MergeIterator},
    ptable::{parse_table_id, table_file_name, PTable},
    IndexConfig,
};
use crate::{error::CorruptIndexError, file::rewrite_atomic, stop_signal::StopSignal};
use md5::{Digest, Md5};
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Manifest format written by this version
pub const INDEX_MAP_VERSION: u32 = 2;

/// Manifest format without the max auto-merge level line
const INDEX_MAP_VERSION_V1: u32 = 1;

fn manifest_error<P: AsRef<Path>>(path: P, reason: impl Into<String>) -> crate::Error {
    crate::Error::CorruptIndex(CorruptIndexError::Manifest {
        path: path.as_ref().to_path_buf(),
        reason: reason.into(),
    })
}

/// Outcome of a merge
pub struct MergeResult {
    /// The map after the merge
    pub map: IndexMap,

    /// Tables that were merged away
    ///
    /// They may only be deleted after `map` is durably saved.
    pub to_delete: Vec<Arc<PTable>>,

    /// `true` if another level is due for merging
    pub has_more: bool,
}

/// Immutable list of tables, organized into merge levels
///
/// Every change produces a new map, so readers can keep using an older map
/// while a merge is running.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct IndexMap {
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
    max_tables_per_level: usize,
    max_auto_merge_level: u32,

    /// Tables per level, oldest first
    levels: Vec<Vec<Arc<PTable>>>,
}

impl IndexMap {
    /// Creates an empty map
    #[must_use]
    pub fn empty(max_tables_per_level: usize, max_auto_merge_level: u32) -> Self {
        Self {
            prepare_checkpoint: -1,
            commit_checkpoint: -1,
            max_tables_per_level,
            max_auto_merge_level,
            levels: vec![],
        }
    }

    /// Loads the manifest and opens all tables it references
    ///
    /// A missing manifest yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorruptIndex`] if the manifest is damaged,
    /// references a missing table, or was written with a higher max auto-merge level
    /// than configured.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        folder: &Path,
        config: &IndexConfig,
    ) -> crate::Result<Self> {
        let path = path.as_ref();

        if !path.try_exists()? {
            log::debug!("No index map at {path:?}, starting with empty index");
            return Ok(Self::empty(
                config.max_tables_per_level,
                config.max_auto_merge_level,
            ));
        }

        let text = std::fs::read_to_string(path)?;

        let Some((stored_hash, content)) = text.split_once('\n') else {
            return Err(manifest_error(path, "missing hash line"));
        };

        let hash = hex::encode_upper(Md5::digest(content.as_bytes()));
        if !hash.eq_ignore_ascii_case(stored_hash.trim()) {
            log::error!("Index map hash mismatch: stored {stored_hash:?}, computed {hash:?}");
            return Err(crate::Error::CorruptIndex(
                CorruptIndexError::HashValidation {
                    path: path.to_path_buf(),
                },
            ));
        }

        let mut lines = content.lines();

        let version = lines
            .next()
            .and_then(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| manifest_error(path, "missing or invalid version line"))?;

        if version != INDEX_MAP_VERSION && version != INDEX_MAP_VERSION_V1 {
            return Err(manifest_error(
                path,
                format!("unsupported index map version {version}"),
            ));
        }

        let (prepare_checkpoint, commit_checkpoint) = lines
            .next()
            .and_then(|line| line.trim().split_once('/'))
            .and_then(|(prepare, commit)| Some((prepare.parse::<i64>().ok()?, commit.parse::<i64>().ok()?)))
            .ok_or_else(|| manifest_error(path, "missing or invalid checkpoint line"))?;

        let max_auto_merge_level = if version == INDEX_MAP_VERSION_V1 {
            log::info!("Index map {path:?} has version 1, it will be upgraded on next save");
            config.max_auto_merge_level
        } else {
            let stored = lines
                .next()
                .and_then(|line| line.trim().parse::<u32>().ok())
                .ok_or_else(|| manifest_error(path, "missing or invalid max auto-merge level"))?;

            if stored < config.max_auto_merge_level {
                return Err(manifest_error(
                    path,
                    format!(
                        "max auto-merge level {} is higher than stored level {stored}, which would merge manually merged tables again",
                        config.max_auto_merge_level
                    ),
                ));
            }

            if stored > config.max_auto_merge_level {
                log::info!(
                    "Lowering max auto-merge level from {stored} to {}",
                    config.max_auto_merge_level
                );
            }

            config.max_auto_merge_level
        };

        let mut table_lines = vec![];

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }

            let mut parts = line.trim().splitn(3, ',');

            let (Some(level), Some(position), Some(file_name)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(manifest_error(path, format!("invalid table line {line:?}")));
            };

            let level = level
                .parse::<usize>()
                .map_err(|_| manifest_error(path, format!("invalid level in {line:?}")))?;
            let position = position
                .parse::<usize>()
                .map_err(|_| manifest_error(path, format!("invalid position in {line:?}")))?;
            let id = parse_table_id(file_name)
                .ok_or_else(|| manifest_error(path, format!("invalid file name in {line:?}")))?;

            table_lines.push((level, position, id));
        }

        table_lines.sort_unstable();

        if !table_lines.is_empty() && (prepare_checkpoint < 0 || commit_checkpoint < 0) {
            return Err(manifest_error(
                path,
                format!(
                    "tables exist, but checkpoints are {prepare_checkpoint}/{commit_checkpoint}"
                ),
            ));
        }

        let mut levels: Vec<Vec<Arc<PTable>>> = vec![];

        for (level, position, id) in table_lines {
            while levels.len() <= level {
                levels.push(vec![]);
            }

            #[allow(clippy::indexing_slicing)]
            let tables = &mut levels[level];

            if tables.len() != position {
                return Err(manifest_error(
                    path,
                    format!("level {level} has a gap or duplicate at position {position}"),
                ));
            }

            let table_path = folder.join(table_file_name(id));

            if !table_path.try_exists()? {
                log::error!("Index map references missing table {table_path:?}");
                return Err(crate::Error::CorruptIndex(CorruptIndexError::MissingTable(
                    table_path,
                )));
            }

            let table = PTable::open(
                &table_path,
                id,
                config.verify_hashes,
                config.descriptor_count,
            )?;

            tables.push(Arc::new(table));
        }

        log::debug!(
            "Loaded index map with {} tables, checkpoints {prepare_checkpoint}/{commit_checkpoint}",
            levels.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            prepare_checkpoint,
            commit_checkpoint,
            max_tables_per_level: config.max_tables_per_level,
            max_auto_merge_level,
            levels,
        })
    }

    // NOTE: Writing into a String is infallible
    #[allow(clippy::expect_used)]
    fn encode(&self) -> String {
        let mut content = String::new();

        writeln!(content, "{INDEX_MAP_VERSION}").expect("should write");
        writeln!(
            content,
            "{}/{}",
            self.prepare_checkpoint, self.commit_checkpoint
        )
        .expect("should write");
        writeln!(content, "{}", self.max_auto_merge_level).expect("should write");

        for (level, tables) in self.levels.iter().enumerate() {
            for (position, table) in tables.iter().enumerate() {
                writeln!(content, "{level},{position},{}", table.file_name())
                    .expect("should write");
            }
        }

        let hash = hex::encode_upper(Md5::digest(content.as_bytes()));
        format!("{hash}\n{content}")
    }

    /// Durably writes the manifest
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        log::trace!("Saving index map to {path:?}");

        rewrite_atomic(path, self.encode().as_bytes())?;
        Ok(())
    }

    /// Prepare position up to which the log is indexed in tables
    #[must_use]
    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    /// Commit position up to which the log is indexed in tables
    #[must_use]
    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    /// Levels at or above this are only merged by [`IndexMap::merge_all`]
    #[must_use]
    pub fn max_auto_merge_level(&self) -> u32 {
        self.max_auto_merge_level
    }

    /// Tables per level, oldest first
    #[must_use]
    pub fn levels(&self) -> &[Vec<Arc<PTable>>] {
        &self.levels
    }

    /// Amount of tables
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Amount of entries in all tables
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.in_order().map(|table| table.count()).sum()
    }

    /// Iterates over all tables, newest first
    pub fn in_order(&self) -> impl Iterator<Item = &Arc<PTable>> + '_ {
        self.levels.iter().flat_map(|tables| tables.iter().rev())
    }

    /// Returns a new map with `table` added to level 0
    #[must_use]
    pub fn add_ptable(&self, table: Arc<PTable>, prepare: i64, commit: i64) -> Self {
        let mut map = self.clone();

        if map.levels.is_empty() {
            map.levels.push(vec![]);
        }

        if let Some(level_0) = map.levels.first_mut() {
            level_0.push(table);
        }

        map.prepare_checkpoint = prepare;
        map.commit_checkpoint = commit;
        map
    }

    /// Returns `true` if a level below the max auto-merge level is full
    #[must_use]
    pub fn needs_merge(&self) -> bool {
        self.auto_merge_candidate().is_some()
    }

    fn auto_merge_candidate(&self) -> Option<usize> {
        self.levels.iter().enumerate().position(|(level, tables)| {
            (level as u64) < u64::from(self.max_auto_merge_level)
                && tables.len() >= self.max_tables_per_level
        })
    }

    fn merge_tables(
        tables: &[Arc<PTable>],
        path: &Path,
        id: u64,
        config: &IndexConfig,
        stop_signal: &StopSignal,
    ) -> crate::Result<PTable> {
        let iterators = tables
            .iter()
            .map(|table| Ok(Box::new(table.iter()?) as BoxedIterator<'_>))
            .collect::<crate::Result<Vec<_>>>()?;

        let merger = MergeIterator::new(iterators);
        PTable::write(path, merger, config.cache_depth, stop_signal)?;

        PTable::open(path, id, false, config.descriptor_count)
    }

    /// Merges the lowest level that is full, if any, into one table on the next level
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Cancelled`] if the stop signal was sent.
    pub fn try_merge_one_level(
        &self,
        folder: &Path,
        id: u64,
        config: &IndexConfig,
        stop_signal: &StopSignal,
    ) -> crate::Result<Option<MergeResult>> {
        let Some(level) = self.auto_merge_candidate() else {
            return Ok(None);
        };

        let Some(tables) = self.levels.get(level) else {
            return Ok(None);
        };

        log::debug!("Merging {} tables of level {level}", tables.len());

        // NOTE: Merge sources are given newest first
        let sources = tables.iter().rev().cloned().collect::<Vec<_>>();
        let path: PathBuf = folder.join(table_file_name(id));
        let merged = Self::merge_tables(&sources, &path, id, config, stop_signal)?;

        log::debug!(
            "Merged {} tables of level {level} into {merged:?}",
            sources.len()
        );

        let mut map = self.clone();

        if let Some(tables) = map.levels.get_mut(level) {
            tables.clear();
        }

        if map.levels.len() <= level + 1 {
            map.levels.push(vec![]);
        }
        if let Some(tables) = map.levels.get_mut(level + 1) {
            tables.push(Arc::new(merged));
        }

        let has_more = map.needs_merge();

        Ok(Some(MergeResult {
            map,
            to_delete: sources,
            has_more,
        }))
    }

    /// Merges all tables at or above the max auto-merge level into one table
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Cancelled`] if the stop signal was sent.
    pub fn merge_all(
        &self,
        folder: &Path,
        id: u64,
        config: &IndexConfig,
        stop_signal: &StopSignal,
    ) -> crate::Result<Option<MergeResult>> {
        let first_level = usize::try_from(self.max_auto_merge_level).unwrap_or(usize::MAX);

        let sources = self
            .levels
            .iter()
            .skip(first_level)
            .flat_map(|tables| tables.iter().rev())
            .cloned()
            .collect::<Vec<_>>();

        if sources.len() < 2 {
            log::debug!("Nothing to merge above level {first_level}");
            return Ok(None);
        }

        log::info!(
            "Manually merging {} tables at or above level {first_level}",
            sources.len()
        );

        let path = folder.join(table_file_name(id));
        let merged = Self::merge_tables(&sources, &path, id, config, stop_signal)?;

        let mut map = self.clone();
        map.levels.truncate(first_level);
        while map.levels.len() < first_level {
            map.levels.push(vec![]);
        }
        map.levels.push(vec![Arc::new(merged)]);

        Ok(Some(MergeResult {
            map,
            to_delete: sources,
            has_more: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::IndexEntry;
    use test_log::test;

    fn config() -> IndexConfig {
        IndexConfig {
            max_tables_per_level: 2,
            ..IndexConfig::default()
        }
    }

    fn table(folder: &Path, id: u64, entries: Vec<IndexEntry>) -> crate::Result<Arc<PTable>> {
        let path = folder.join(table_file_name(id));
        PTable::write(&path, entries.into_iter().map(Ok), 16, &StopSignal::default())?;
        Ok(Arc::new(PTable::open(&path, id, true, 1)?))
    }

    #[test]
    fn index_map_empty_encoding() {
        let map = IndexMap::empty(4, 5);
        let text = map.encode();

        assert_eq!(5, text.split('\n').count());
        assert!(text.ends_with("\n2\n-1/-1\n5\n"));
    }

    #[test]
    fn index_map_add_in_order() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        let map = IndexMap::empty(4, u32::MAX);
        let map = map.add_ptable(table(folder.path(), 0, vec![])?, 10, 10);
        let map = map.add_ptable(table(folder.path(), 1, vec![])?, 20, 20);

        assert_eq!(20, map.prepare_checkpoint());
        assert_eq!(
            vec![1, 0],
            map.in_order().map(|t| t.id()).collect::<Vec<_>>()
        );

        Ok(())
    }

    #[test]
    fn index_map_merge_one_level() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let config = config();

        let map = IndexMap::empty(config.max_tables_per_level, config.max_auto_merge_level);
        assert!(map
            .try_merge_one_level(folder.path(), 9, &config, &StopSignal::default())?
            .is_none());

        let map = map.add_ptable(
            table(folder.path(), 0, vec![IndexEntry::new(1, 1, 10), IndexEntry::new(1, 0, 0)])?,
            1,
            1,
        );
        let map = map.add_ptable(
            table(folder.path(), 1, vec![IndexEntry::new(2, 0, 20), IndexEntry::new(1, 1, 11)])?,
            2,
            2,
        );

        let Some(result) =
            map.try_merge_one_level(folder.path(), 2, &config, &StopSignal::default())?
        else {
            panic!("level 0 should be merged");
        };

        assert!(!result.has_more);
        assert_eq!(2, result.to_delete.len());
        assert_eq!(1, result.map.table_count());
        assert_eq!(3, result.map.entry_count());
        assert!(result.map.levels()[0].is_empty());
        assert_eq!(2, result.map.levels()[1][0].id());

        // Newest table wins
        assert_eq!(Some(11), result.map.levels()[1][0].get(1, 1)?);

        Ok(())
    }

    #[test]
    fn index_map_merge_all() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let config = IndexConfig {
            max_auto_merge_level: 0,
            ..config()
        };

        let map = IndexMap::empty(config.max_tables_per_level, config.max_auto_merge_level);
        let map = map.add_ptable(table(folder.path(), 0, vec![IndexEntry::new(1, 0, 0)])?, 1, 1);
        let map = map.add_ptable(table(folder.path(), 1, vec![IndexEntry::new(1, 0, 5)])?, 2, 2);
        let map = map.add_ptable(table(folder.path(), 2, vec![IndexEntry::new(2, 0, 7)])?, 3, 3);

        // Nothing is merged automatically at level 0
        assert!(map
            .try_merge_one_level(folder.path(), 3, &config, &StopSignal::default())?
            .is_none());

        let Some(result) = map.merge_all(folder.path(), 3, &config, &StopSignal::default())?
        else {
            panic!("tables should be merged");
        };

        assert_eq!(3, result.to_delete.len());
        assert_eq!(1, result.map.table_count());
        assert_eq!(2, result.map.entry_count());
        assert_eq!(Some(5), result.map.levels()[0][0].get(1, 0)?);

        Ok(())
    }
}
