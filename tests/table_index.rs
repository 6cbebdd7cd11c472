use chunkstore::{
    index::{entry::IndexEntry, hash::stream_hash, ptable::PTable, IndexConfig, TableIndex},
    CorruptIndexError, Error, StopSignal,
};
use test_log::test;

const STREAM_COUNT: u64 = 10;
const EVENTS_PER_STREAM: i64 = 50;

fn config() -> IndexConfig {
    IndexConfig {
        max_memtable_entries: 64,
        max_tables_per_level: 2,
        cache_depth: 4,
        ..IndexConfig::default()
    }
}

/// Tables are only merged on request
fn manual_merge_config() -> IndexConfig {
    IndexConfig {
        max_auto_merge_level: 0,
        ..config()
    }
}

fn fill(index: &TableIndex) -> chunkstore::Result<i64> {
    let mut position = 0;

    for version in 0..EVENTS_PER_STREAM {
        for stream in 0..STREAM_COUNT {
            index.add_entries(
                position,
                position,
                &[IndexEntry::new(stream, version, position)],
            )?;
            position += 100;
        }
    }

    Ok(position - 100)
}

#[test]
fn table_index_lookups_after_flush() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = TableIndex::open(folder.path(), config(), None)?;

    let last_position = fill(&index)?;
    index.seal_active_memtable();
    index.wait_for_background_tasks()?;

    let snapshot = index.snapshot();
    assert_eq!(0, snapshot.sealed_count());
    assert_eq!(0, snapshot.active_len());
    assert!(snapshot.map().table_count() > 0);
    assert_eq!(
        (last_position, last_position),
        index.table_checkpoints()
    );

    let mut position = 0;
    for version in 0..EVENTS_PER_STREAM {
        for stream in 0..STREAM_COUNT {
            assert_eq!(Some(position), index.get(stream, version)?);
            position += 100;
        }
    }

    assert_eq!(None, index.get(STREAM_COUNT, 0)?);
    assert_eq!(None, index.get(0, EVENTS_PER_STREAM)?);

    let latest = index.try_get_latest_entry(3)?.expect("should exist");
    assert_eq!(EVENTS_PER_STREAM - 1, latest.version);

    let oldest = index.try_get_oldest_entry(3)?.expect("should exist");
    assert_eq!(0, oldest.version);
    assert_eq!(300, oldest.position);

    Ok(())
}

#[test]
fn table_index_range() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = TableIndex::open(folder.path(), config(), None)?;

    fill(&index)?;
    index.wait_for_background_tasks()?;

    let range = index.get_range(5, 10, 19, usize::MAX)?;
    assert_eq!(
        (10..=19).rev().collect::<Vec<_>>(),
        range.iter().map(|e| e.version).collect::<Vec<_>>()
    );
    assert!(range.iter().all(|e| e.stream == 5));

    let limited = index.get_range(5, 0, EVENTS_PER_STREAM, 3)?;
    assert_eq!(
        vec![49, 48, 47],
        limited.iter().map(|e| e.version).collect::<Vec<_>>()
    );

    assert!(index.get_range(5, 20, 10, 100)?.is_empty());

    Ok(())
}

#[test]
fn table_index_merge_newest_wins() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = TableIndex::open(folder.path(), manual_merge_config(), None)?;

    let stream = stream_hash("duplicated");

    index.add_entries(0, 0, &[IndexEntry::new(stream, 0, 0)])?;
    index.add_entries(10, 10, &[IndexEntry::new(stream, 1, 10)])?;
    index.seal_active_memtable();
    index.wait_for_background_tasks()?;

    // Replayed records index the same events at newer positions
    index.add_entries(20, 20, &[IndexEntry::new(stream, 1, 20)])?;
    index.add_entries(30, 30, &[IndexEntry::new(stream, 2, 30)])?;
    index.seal_active_memtable();
    index.wait_for_background_tasks()?;

    let snapshot = index.snapshot();
    assert_eq!(2, snapshot.map().table_count());
    assert!(index.merge_all()?);

    let snapshot = index.snapshot();
    assert_eq!(1, snapshot.map().table_count());
    assert_eq!(3, snapshot.map().entry_count());

    assert_eq!(Some(0), index.get(stream, 0)?);
    assert_eq!(Some(20), index.get(stream, 1)?);
    assert_eq!(Some(30), index.get(stream, 2)?);

    Ok(())
}

#[test]
fn table_index_merge_distinct_count() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let index = TableIndex::open(folder.path(), manual_merge_config(), None)?;

    fill(&index)?;
    index.seal_active_memtable();
    index.wait_for_background_tasks()?;
    assert!(index.snapshot().map().table_count() > 1);

    assert!(index.merge_all()?);

    let snapshot = index.snapshot();
    assert_eq!(1, snapshot.map().table_count());
    assert_eq!(
        STREAM_COUNT * EVENTS_PER_STREAM as u64,
        snapshot.map().entry_count()
    );

    let table = snapshot.map().in_order().next().expect("should exist");
    let entries = table.iter()?.collect::<chunkstore::Result<Vec<_>>>()?;
    assert!(entries.windows(2).all(|w| w[0].key() < w[1].key()));

    Ok(())
}

#[test]
fn table_index_reopen() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;

    let last_position = {
        let index = TableIndex::open(folder.path(), config(), None)?;
        let last_position = fill(&index)?;
        index.seal_active_memtable();
        index.wait_for_background_tasks()?;
        last_position
    };

    let index = TableIndex::open(folder.path(), config(), None)?;
    assert_eq!((last_position, last_position), index.table_checkpoints());
    assert_eq!(Some(0), index.get(0, 0)?);
    assert_eq!(Some(last_position), index.get(STREAM_COUNT - 1, EVENTS_PER_STREAM - 1)?);

    Ok(())
}

#[test]
fn ptable_invalid_header_flag() -> chunkstore::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("1.ptable");

    PTable::write(
        &path,
        vec![Ok(IndexEntry::new(1, 0, 0))],
        4,
        &StopSignal::default(),
    )?;

    let mut bytes = std::fs::read(&path)?;
    bytes[0] = 0xFF;
    std::fs::write(&path, bytes)?;

    let result = PTable::open(&path, 1, false, 1);
    assert!(matches!(
        result,
        Err(Error::CorruptIndex(CorruptIndexError::InvalidFile(_)))
    ));

    Ok(())
}
