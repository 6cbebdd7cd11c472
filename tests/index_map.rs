use chunkstore::{
    index::{
        entry::IndexEntry,
        map::IndexMap,
        ptable::{table_file_name, PTable},
        IndexConfig,
    },
    CorruptIndexError, Error, StopSignal,
};
use md5::{Digest, Md5};
use std::{path::Path, sync::Arc};
use test_log::test;

const MAP_FILE: &str = "indexmap";

fn table(folder: &Path, id: u64, entries: Vec<IndexEntry>) -> chunkstore::Result<Arc<PTable>> {
    let path = folder.join(table_file_name(id));
    PTable::write(&path, entries.into_iter().map(Ok), 16, &StopSignal::default())?;
    Ok(Arc::new(PTable::open(&path, id, true, 1)?))
}

fn write_manifest(path: &Path, content: &str) -> std::io::Result<()> {
    let hash = hex::encode_upper(Md5::digest(content.as_bytes()));
    std::fs::write(path, format!("{hash}\n{content}"))
}

#[test]
fn index_map_missing_file_is_empty() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;

    let map = IndexMap::from_file(
        folder.path().join(MAP_FILE),
        folder.path(),
        &IndexConfig::default(),
    )?;

    assert_eq!(-1, map.prepare_checkpoint());
    assert_eq!(-1, map.commit_checkpoint());
    assert_eq!(0, map.table_count());

    Ok(())
}

#[test]
fn index_map_empty_has_five_lines() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    IndexMap::empty(4, 7).save(&path)?;

    let text = std::fs::read_to_string(&path)?;
    let lines = text.split('\n').collect::<Vec<_>>();

    assert_eq!(5, lines.len());
    assert_eq!(32, lines[0].len());
    assert_eq!(["2", "-1/-1", "7", ""], lines[1..]);

    Ok(())
}

#[test]
fn index_map_round_trip() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    let config = IndexConfig {
        max_tables_per_level: 8,
        ..IndexConfig::default()
    };

    let map = IndexMap::empty(config.max_tables_per_level, config.max_auto_merge_level);
    let map = map.add_ptable(table(folder.path(), 1, vec![IndexEntry::new(1, 0, 0)])?, 5, 5);
    let map = map.add_ptable(table(folder.path(), 2, vec![IndexEntry::new(1, 1, 10)])?, 7, 10);
    map.save(&path)?;

    let loaded = IndexMap::from_file(&path, folder.path(), &config)?;

    assert_eq!(7, loaded.prepare_checkpoint());
    assert_eq!(10, loaded.commit_checkpoint());
    assert_eq!(
        vec![2, 1],
        loaded.in_order().map(|t| t.id()).collect::<Vec<_>>()
    );
    assert_eq!(2, loaded.entry_count());

    Ok(())
}

#[test]
fn index_map_hash_mismatch() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    IndexMap::empty(4, u32::MAX).save(&path)?;

    let text = std::fs::read_to_string(&path)?.replace("-1/-1", "-1/-2");
    std::fs::write(&path, text)?;

    let result = IndexMap::from_file(&path, folder.path(), &IndexConfig::default());
    assert!(matches!(
        result,
        Err(Error::CorruptIndex(CorruptIndexError::HashValidation { .. }))
    ));

    Ok(())
}

#[test]
fn index_map_missing_table() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    write_manifest(&path, "2\n5/5\n4294967295\n0,0,99.ptable\n")?;

    let result = IndexMap::from_file(&path, folder.path(), &IndexConfig::default());
    assert!(matches!(
        result,
        Err(Error::CorruptIndex(CorruptIndexError::MissingTable(_)))
    ));

    Ok(())
}

#[test]
fn index_map_v1_upgrade() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    table(folder.path(), 3, vec![IndexEntry::new(1, 0, 0)])?;
    write_manifest(&path, "1\n3/4\n0,0,3.ptable\n")?;

    let config = IndexConfig {
        max_auto_merge_level: 2,
        ..IndexConfig::default()
    };

    let map = IndexMap::from_file(&path, folder.path(), &config)?;
    assert_eq!(3, map.prepare_checkpoint());
    assert_eq!(4, map.commit_checkpoint());
    assert_eq!(2, map.max_auto_merge_level());
    assert_eq!(1, map.table_count());

    // Saving writes the current version, including the max auto-merge level
    map.save(&path)?;
    let text = std::fs::read_to_string(&path)?;
    let lines = text.lines().skip(1).collect::<Vec<_>>();
    assert_eq!(["2", "3/4", "2", "0,0,3.ptable"], *lines);

    Ok(())
}

#[test]
fn index_map_max_auto_merge_level() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    IndexMap::empty(4, 5).save(&path)?;

    // Lowering is allowed
    let lower = IndexConfig {
        max_auto_merge_level: 3,
        ..IndexConfig::default()
    };
    let map = IndexMap::from_file(&path, folder.path(), &lower)?;
    assert_eq!(3, map.max_auto_merge_level());

    // Raising would merge manually merged tables again
    let higher = IndexConfig {
        max_auto_merge_level: 6,
        ..IndexConfig::default()
    };
    let result = IndexMap::from_file(&path, folder.path(), &higher);
    assert!(matches!(
        result,
        Err(Error::CorruptIndex(CorruptIndexError::Manifest { .. }))
    ));

    Ok(())
}

#[test]
fn index_map_rejects_gaps() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join(MAP_FILE);

    table(folder.path(), 1, vec![IndexEntry::new(1, 0, 0)])?;
    write_manifest(&path, "2\n5/5\n4294967295\n0,1,1.ptable\n")?;

    let result = IndexMap::from_file(&path, folder.path(), &IndexConfig::default());
    assert!(matches!(
        result,
        Err(Error::CorruptIndex(CorruptIndexError::Manifest { .. }))
    ));

    Ok(())
}
