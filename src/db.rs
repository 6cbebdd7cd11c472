// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    background_worker::{Activity, BackgroundWorker},
    chaser::TransactionFileChaser,
    checkpoint::{CheckpointHandle, Checkpoints},
    chunk_db::ChunkDb,
    file::INDEX_FOLDER,
    index::{committer::IndexCommitter, hash::stream_hash, IndexConfig, TableIndex},
    poison_dart::PoisonDart,
    reader_pool::ReaderPool,
    record::{CommitLogRecord, LogPosition, LogRecord, PrepareFlags, PrepareLogRecord},
    scavenge::{scavenge_chunk, ScavengeResult},
    stop_signal::StopSignal,
    writer::TransactionFileWriter,
    Config,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

/// Records the chaser indexes before it checks the stop signal again
const CHASER_BATCH_SIZE: usize = 1_000;

/// How long an idle chaser waits for the writer to flush
const CHASER_IDLE_WAIT: Duration = Duration::from_millis(10);

/// How long a read waits for a reader to be returned to the pool
const READER_LEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest sleep of the flush worker between checks
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An event to be written as part of a transaction
#[derive(Clone, Copy, Debug)]
pub struct EventData<'a> {
    /// Event type
    pub event_type: &'a str,

    /// Event payload
    pub data: &'a [u8],

    /// Event metadata
    pub metadata: &'a [u8],
}

impl<'a> EventData<'a> {
    /// Creates an event without metadata
    #[must_use]
    pub fn new(event_type: &'a str, data: &'a [u8]) -> Self {
        Self {
            event_type,
            data,
            metadata: b"",
        }
    }
}

/// An event read back from the log
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedEvent {
    /// Event number inside its stream
    pub event_number: i64,

    /// Position of the prepare record in the log
    pub log_position: LogPosition,

    /// The prepare record carrying the event
    pub record: PrepareLogRecord,
}

pub struct DatabaseInner {
    config: Config,
    chunk_db: Arc<ChunkDb>,
    writer: Arc<Mutex<TransactionFileWriter>>,
    index: Arc<TableIndex>,
    readers: ReaderPool,

    /// Position up to which the chaser has fed the index
    indexed_position: Arc<AtomicI64>,

    stop_signal: StopSignal,
    active_thread_counter: Arc<AtomicUsize>,
    is_poisoned: Arc<AtomicBool>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        log::debug!("Dropping database");

        self.stop_signal.send();

        while self.active_thread_counter.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(10));
        }

        self.index.shutdown();

        if let Err(e) = self.lock_writer().flush(true) {
            log::error!("Flush error on drop: {e:?}");
        }

        if self.config.clean_path_on_drop {
            log::trace!("Cleaning up database folder {:?}", self.config.path);

            if let Err(e) = std::fs::remove_dir_all(&self.config.path) {
                log::error!("Failed to clean up path: {:?} - {e}", self.config.path);
            }
        }
    }
}

impl DatabaseInner {
    fn lock_writer(&self) -> MutexGuard<'_, TransactionFileWriter> {
        #[allow(clippy::expect_used)]
        self.writer.lock().expect("lock is poisoned")
    }
}

/// An event log with a stream index
///
/// Events are appended to the chunked transaction log. A chaser thread follows the
/// durable end of the log and feeds every record into the stream index, which maps
/// `(stream, event number)` to log positions.
#[derive(Clone)]
pub struct Database(Arc<DatabaseInner>);

impl std::ops::Deref for Database {
    type Target = DatabaseInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Opens the index, throwing it away if it covers more log than exists
fn open_index(
    folder: &Path,
    config: &Config,
    checkpoints: &Checkpoints,
) -> crate::Result<TableIndex> {
    let index = TableIndex::open(
        folder,
        IndexConfig::from(config),
        Some(checkpoints.index.clone()),
    )?;

    let (_, commit_checkpoint) = index.table_checkpoints();
    let writer_checkpoint = checkpoints.writer.read();

    if commit_checkpoint < 0 || commit_checkpoint < writer_checkpoint {
        return Ok(index);
    }

    log::warn!(
        "Index is ahead of the log (index={commit_checkpoint}, writer={writer_checkpoint}), rebuilding index"
    );

    drop(index);
    std::fs::remove_dir_all(folder)?;

    checkpoints.index.write(-1);
    checkpoints.index.flush()?;

    TableIndex::open(
        folder,
        IndexConfig::from(config),
        Some(checkpoints.index.clone()),
    )
}

impl Database {
    /// Opens a database in the given directory.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open_in<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        Self::open(Config::new(path))
    }

    /// Opens the database, replaying the part of the log the index does not cover
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the log or the index is damaged.
    pub fn open(config: Config) -> crate::Result<Self> {
        log::debug!("Opening database at {:?}", config.path);

        let chunk_db = Arc::new(ChunkDb::open(config.clone())?);
        let checkpoints = chunk_db.checkpoints();

        let index = open_index(&config.path.join(INDEX_FOLDER), &config, checkpoints)?;

        let (prepare_checkpoint, commit_checkpoint) = index.table_checkpoints();
        let replay_start = checkpoints
            .chaser
            .read()
            .min(IndexCommitter::replay_start(prepare_checkpoint, commit_checkpoint));

        log::debug!(
            "Replaying log from {replay_start} (index prepare={prepare_checkpoint}, commit={commit_checkpoint})"
        );

        checkpoints.chaser.write(replay_start);
        checkpoints.chaser.flush()?;

        let readers = ReaderPool::new(&chunk_db, config.reader_pool_size());
        let writer = TransactionFileWriter::open(chunk_db.clone())?;
        let chaser = TransactionFileChaser::new(readers.lease(), checkpoints.chaser.clone());

        let inner = DatabaseInner {
            writer: Arc::new(Mutex::new(writer)),
            index: Arc::new(index),
            indexed_position: Arc::new(AtomicI64::new(replay_start)),
            readers,
            stop_signal: StopSignal::default(),
            active_thread_counter: Arc::default(),
            is_poisoned: Arc::default(),
            chunk_db: chunk_db.clone(),
            config,
        };

        BackgroundWorker::new(
            ChaserWorker {
                chaser,
                committer: IndexCommitter::new(),
                index: inner.index.clone(),
                indexed_position: inner.indexed_position.clone(),
                writer_checkpoint: chunk_db.checkpoints().writer.clone(),
                stop_signal: inner.stop_signal.clone(),
            },
            PoisonDart::new("chaser", inner.is_poisoned.clone()),
            inner.active_thread_counter.clone(),
            inner.stop_signal.clone(),
        )
        .spawn()?;

        BackgroundWorker::new(
            FlushWorker {
                writer: inner.writer.clone(),
                poll_interval: inner
                    .config
                    .min_flush_delay
                    .clamp(Duration::from_millis(1), FLUSH_POLL_INTERVAL),
            },
            PoisonDart::new("flusher", inner.is_poisoned.clone()),
            inner.active_thread_counter.clone(),
            inner.stop_signal.clone(),
        )
        .spawn()?;

        Ok(Self(Arc::new(inner)))
    }

    /// Database configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The chunked transaction log
    #[must_use]
    pub fn chunk_db(&self) -> &Arc<ChunkDb> {
        &self.chunk_db
    }

    /// The stream index
    #[must_use]
    pub fn index(&self) -> &TableIndex {
        &self.index
    }

    /// Returns `true` if a background worker or the index worker failed
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.is_poisoned.load(Ordering::Acquire) || self.index.is_poisoned()
    }

    /// Log position up to which records have been fed to the index
    #[must_use]
    pub fn indexed_position(&self) -> LogPosition {
        self.indexed_position.load(Ordering::Acquire)
    }

    /// Position the next record is written at
    #[must_use]
    pub fn writer_position(&self) -> LogPosition {
        self.lock_writer().position()
    }

    /// Appends a single self-committed event to a stream
    ///
    /// The event gets the number `expected_version + 1`. The log is flushed
    /// unless the last flush happened less than the minimum flush delay ago,
    /// in which case the flush worker picks it up once the delay has passed.
    ///
    /// Returns the log position of the event.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the event does not fit into a chunk.
    pub fn append(
        &self,
        stream: &str,
        expected_version: i64,
        event: EventData<'_>,
    ) -> crate::Result<LogPosition> {
        let mut writer = self.lock_writer();

        let record = PrepareLogRecord::single_write(
            writer.position(),
            stream,
            expected_version,
            event.event_type,
            event.data,
            event.metadata,
        );

        let (log_position, _) = writer.write(LogRecord::Prepare(record))?;
        writer.flush(false)?;

        Ok(log_position)
    }

    /// Appends events to a stream as one explicit transaction
    ///
    /// Every event is written as a prepare, followed by a commit record that
    /// assigns the numbers `expected_version + 1` onwards. The events become
    /// visible to the index only once the commit record is read.
    ///
    /// Returns the log position of the commit record.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or an event does not fit into a chunk.
    pub fn append_transaction(
        &self,
        stream: &str,
        expected_version: i64,
        events: &[EventData<'_>],
    ) -> crate::Result<LogPosition> {
        let mut writer = self.lock_writer();

        let mut transaction_position = writer.position();

        for (offset, event) in (0i32..).zip(events) {
            let mut record = PrepareLogRecord::single_write(
                writer.position(),
                stream,
                expected_version,
                event.event_type,
                event.data,
                event.metadata,
            );

            record.flags = PrepareFlags::DATA;
            if offset == 0 {
                record.flags = record.flags | PrepareFlags::TRANSACTION_BEGIN;
            } else {
                record.transaction_position = transaction_position;
            }
            if usize::try_from(offset).is_ok_and(|offset| offset + 1 == events.len()) {
                record.flags = record.flags | PrepareFlags::TRANSACTION_END;
            }
            record.transaction_offset = offset;

            let (log_position, _) = writer.write(LogRecord::Prepare(record))?;

            // NOTE: The first prepare may have moved to the next chunk
            if offset == 0 {
                transaction_position = log_position;
            }
        }

        let commit =
            CommitLogRecord::new(writer.position(), transaction_position, expected_version + 1);

        let (log_position, _) = writer.write(LogRecord::Commit(commit))?;
        writer.flush(false)?;

        Ok(log_position)
    }

    /// Makes written events durable
    ///
    /// Returns `true` if a flush happened.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&self, force: bool) -> crate::Result<bool> {
        self.lock_writer().flush(force)
    }

    /// Reads the event with the given number from a stream
    ///
    /// Returns `None` if the index has no entry, or the record at the indexed
    /// position belongs to another stream with the same hash.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the log or the index is damaged.
    /// Returns [`crate::Error::ReaderPoolExhausted`] if every reader stays leased.
    pub fn read_event(&self, stream: &str, event_number: i64) -> crate::Result<Option<ResolvedEvent>> {
        let Some(position) = self.index.get(stream_hash(stream), event_number)? else {
            return Ok(None);
        };

        let reader = self
            .readers
            .lease_timeout(READER_LEASE_TIMEOUT)
            .ok_or(crate::Error::ReaderPoolExhausted)?;

        let Some(result) = reader.try_read_at(position, true)? else {
            log::warn!("Index points at {position}, but no record exists there");
            return Ok(None);
        };

        match result.record {
            LogRecord::Prepare(record) if record.event_stream_id == stream => {
                Ok(Some(ResolvedEvent {
                    event_number,
                    log_position: position,
                    record,
                }))
            }
            LogRecord::Prepare(record) => {
                log::trace!(
                    "Stream hash collision at {position}: {stream:?} vs {:?}",
                    record.event_stream_id
                );
                Ok(None)
            }
            LogRecord::Commit(_) => {
                log::warn!("Index points at commit record at {position}");
                Ok(None)
            }
        }
    }

    /// Blocks until every durable record has been fed to the index
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Poisoned`] if the chaser or the index worker failed.
    pub fn wait_for_indexing(&self) -> crate::Result<()> {
        let target = self.chunk_db.checkpoints().writer.read();

        loop {
            if self.is_poisoned() {
                return Err(crate::Error::Poisoned);
            }

            if self.indexed_position() >= target {
                return Ok(());
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Merges all index tables at or above the max auto-merge level into one
    ///
    /// Returns `true` if a merge happened.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn merge_index(&self) -> crate::Result<bool> {
        self.index.merge_all()
    }

    /// Scavenges a completed chunk, keeping records `keep` returns `true` for
    ///
    /// Returns `None` if the chunk is still active.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChunkNotFound`] if the chunk does not exist.
    pub fn scavenge<F: FnMut(&LogRecord) -> bool>(
        &self,
        chunk_number: i32,
        keep: F,
    ) -> crate::Result<Option<ScavengeResult>> {
        scavenge_chunk(&self.chunk_db, chunk_number, keep, &self.stop_signal)
    }
}

/// Follows the durable end of the log and indexes every record
struct ChaserWorker {
    chaser: TransactionFileChaser,
    committer: IndexCommitter,
    index: Arc<TableIndex>,
    indexed_position: Arc<AtomicI64>,
    writer_checkpoint: CheckpointHandle,
    stop_signal: StopSignal,
}

impl Activity for ChaserWorker {
    fn name(&self) -> &'static str {
        "chaser"
    }

    fn run(&mut self) -> crate::Result<()> {
        let mut read = 0;

        while read < CHASER_BATCH_SIZE && !self.stop_signal.is_stopped() {
            let Some(result) = self.chaser.try_read_next()? else {
                break;
            };

            self.committer.commit(&result.record, &self.index)?;
            self.indexed_position
                .store(result.post_position, Ordering::Release);

            read += 1;
        }

        if read == 0 || self.stop_signal.is_stopped() {
            self.indexed_position
                .store(self.chaser.position(), Ordering::Release);
            self.chaser.flush()?;

            if read == 0 {
                self.writer_checkpoint.wait_for_flush(CHASER_IDLE_WAIT);
            }
        }

        Ok(())
    }
}

/// Flushes records the writer left pending because of the minimum flush delay
struct FlushWorker {
    writer: Arc<Mutex<TransactionFileWriter>>,
    poll_interval: Duration,
}

impl Activity for FlushWorker {
    fn name(&self) -> &'static str {
        "flusher"
    }

    fn run(&mut self) -> crate::Result<()> {
        std::thread::sleep(self.poll_interval);

        #[allow(clippy::expect_used)]
        let mut writer = self.writer.lock().expect("lock is poisoned");

        if writer.flush_if_due()? {
            log::trace!("flusher: flushed writer at {}", writer.position());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open(folder: &Path) -> crate::Result<Database> {
        Config::new(folder)
            .chunk_size(4_096)
            .alignment_size(1)
            .max_memtable_entries(16)
            .open()
    }

    #[test]
    fn database_append_read() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;

        for version in -1..9 {
            db.append("orders", version, EventData::new("placed", b"hello"))?;
        }
        db.flush(true)?;
        db.wait_for_indexing()?;

        let event = db.read_event("orders", 3)?.expect("should exist");
        assert_eq!(3, event.event_number);
        assert_eq!("orders", event.record.event_stream_id);
        assert_eq!(&*event.record.data, b"hello");

        assert!(db.read_event("orders", 10)?.is_none());
        assert!(db.read_event("customers", 0)?.is_none());

        Ok(())
    }

    #[test]
    fn database_transaction_visible_after_commit() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;

        db.append_transaction(
            "cart",
            -1,
            &[
                EventData::new("added", b"a"),
                EventData::new("added", b"b"),
                EventData::new("removed", b"a"),
            ],
        )?;
        db.flush(true)?;
        db.wait_for_indexing()?;

        let event = db.read_event("cart", 2)?.expect("should exist");
        assert_eq!("removed", event.record.event_type);
        assert!(event.record.flags.contains(PrepareFlags::TRANSACTION_END));

        let first = db.read_event("cart", 0)?.expect("should exist");
        assert!(first.record.flags.contains(PrepareFlags::TRANSACTION_BEGIN));
        assert!(first.log_position < event.log_position);

        Ok(())
    }

    #[test]
    fn database_reopen_replays_log() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        {
            let db = open(folder.path())?;
            for version in -1..99 {
                db.append("stream", version, EventData::new("type", b"data"))?;
            }
            db.flush(true)?;
            db.wait_for_indexing()?;
        }

        let db = open(folder.path())?;
        db.wait_for_indexing()?;

        for number in 0..100 {
            let event = db.read_event("stream", number)?.expect("should exist");
            assert_eq!(number, event.event_number);
        }

        assert!(db.chunk_db().manager().chunk_count() > 1);

        Ok(())
    }

    fn wait_until_flushed(db: &Database, timeout: Duration) -> bool {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if db.chunk_db().checkpoints().writer.read() >= db.writer_position() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        false
    }

    #[test]
    fn database_idle_writer_gets_flushed() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = Config::new(folder.path()).open()?;

        // Back to back, the second append falls into the minimum flush delay
        db.append("s", -1, EventData::new("type", b"a"))?;
        db.append("s", 0, EventData::new("type", b"b"))?;

        assert!(wait_until_flushed(&db, Duration::from_secs(5)));
        db.wait_for_indexing()?;

        assert_eq!(&*db.read_event("s", 1)?.expect("should exist").record.data, b"b");

        Ok(())
    }

    #[test]
    fn database_long_flush_delay_is_bounded() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = Config::new(folder.path())
            .min_flush_delay(Duration::from_millis(300))
            .open()?;

        db.append("s", -1, EventData::new("type", b"a"))?;

        assert!(wait_until_flushed(&db, Duration::from_secs(5)));
        db.wait_for_indexing()?;

        assert!(db.read_event("s", 0)?.is_some());
        assert!(!db.is_poisoned());

        Ok(())
    }

    #[test]
    fn database_chaser_not_ahead_of_writer() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let db = open(folder.path())?;

        for version in -1..200 {
            db.append("stream", version, EventData::new("type", b"data"))?;

            let checkpoints = db.chunk_db().checkpoints();
            assert!(checkpoints.chaser.read_non_flushed() <= checkpoints.writer.read());
        }

        Ok(())
    }

    #[test]
    fn database_temporary() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("db");

        {
            let db = Config::new(&path).temporary(true).open()?;
            db.append("stream", -1, EventData::new("type", b"data"))?;
        }

        assert!(!path.try_exists()?);

        Ok(())
    }
}
