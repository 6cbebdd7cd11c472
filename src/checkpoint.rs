// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file::{fsync_directory, CHECKPOINT_FILE_EXT};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

/// A named, durable position marker
///
/// `write` only changes the in-memory value, `flush` makes it durable.
/// Callers need to make sure the bytes a checkpoint describes are durable
/// *before* flushing the checkpoint.
pub trait Checkpoint: Send + Sync + std::fmt::Debug {
    /// Name of the checkpoint
    fn name(&self) -> &'static str;

    /// Returns the last flushed value
    fn read(&self) -> i64;

    /// Returns the last written value, which may not be durable yet
    fn read_non_flushed(&self) -> i64;

    /// Sets the in-memory value
    fn write(&self, value: i64);

    /// Persists the in-memory value
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    fn flush(&self) -> crate::Result<()>;

    /// Blocks until the next flush happens, or the timeout expires
    ///
    /// Returns `true` if a flush happened.
    fn wait_for_flush(&self, timeout: Duration) -> bool;
}

/// Identifies the checkpoints of a database
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckpointName {
    /// End of the durable log, owned by the writer
    Writer,

    /// Position up to which the chaser has consumed the log
    Chaser,

    /// Position of the last epoch record, owned by the cluster layer
    Epoch,

    /// Position the log has to be truncated to on next start, or -1
    Truncate,

    /// Position confirmed by replicas, owned by the replication layer
    Replication,

    /// Position up to which the stream index is durable
    Index,
}

impl CheckpointName {
    /// All checkpoints a database keeps
    pub const ALL: [Self; 6] = [
        Self::Writer,
        Self::Chaser,
        Self::Epoch,
        Self::Truncate,
        Self::Replication,
        Self::Index,
    ];

    /// Returns the name of the checkpoint
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Chaser => "chaser",
            Self::Epoch => "epoch",
            Self::Truncate => "truncate",
            Self::Replication => "replication",
            Self::Index => "index",
        }
    }

    /// Value of a freshly created checkpoint
    #[must_use]
    pub fn initial_value(self) -> i64 {
        match self {
            Self::Writer | Self::Chaser => 0,
            Self::Epoch | Self::Truncate | Self::Replication | Self::Index => -1,
        }
    }

    fn file_name(self) -> String {
        format!("{}.{CHECKPOINT_FILE_EXT}", self.as_str())
    }
}

#[derive(Debug, Default)]
struct FlushNotifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl FlushNotifier {
    fn notify(&self) {
        #[allow(clippy::expect_used)]
        let mut generation = self.generation.lock().expect("lock is poisoned");
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        #[allow(clippy::expect_used)]
        let generation = self.generation.lock().expect("lock is poisoned");
        let start = *generation;

        #[allow(clippy::expect_used, let_underscore_lock)]
        let (_, result) = self
            .cond
            .wait_timeout_while(generation, timeout, |g| *g == start)
            .expect("lock is poisoned");

        !result.timed_out()
    }
}

/// Checkpoint backed by an 8 byte little-endian file
///
/// The value is cached in memory, so `read` never touches the disk.
#[derive(Debug)]
pub struct FileCheckpoint {
    name: &'static str,
    path: PathBuf,
    file: Mutex<File>,
    last: AtomicI64,
    last_flushed: AtomicI64,
    notifier: FlushNotifier,
}

impl FileCheckpoint {
    /// Opens the checkpoint file, creating it with `initial` if it does not exist
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or the file is not 8 bytes long.
    pub fn open<P: AsRef<Path>>(path: P, name: &'static str, initial: i64) -> crate::Result<Self> {
        let path = path.as_ref();

        let (file, value) = if path.try_exists()? {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;

            let len = file.metadata()?.len();
            if len != 8 {
                log::error!("Checkpoint {name} at {} has invalid length {len}", path.display());

                return Err(crate::Error::InvalidFile(crate::InvalidFileError {
                    path: path.into(),
                    reason: format!("checkpoint file should be 8 bytes long, but is {len}"),
                }));
            }

            let value = file.read_i64::<LittleEndian>()?;
            (file, value)
        } else {
            log::debug!("Creating checkpoint {name} at {}", path.display());

            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?;

            file.write_i64::<LittleEndian>(initial)?;
            file.sync_all()?;

            if let Some(folder) = path.parent() {
                // IMPORTANT: fsync folder on Unix
                fsync_directory(folder)?;
            }

            (file, initial)
        };

        log::trace!("Opened checkpoint {name} = {value}");

        Ok(Self {
            name,
            path: path.into(),
            file: Mutex::new(file),
            last: AtomicI64::new(value),
            last_flushed: AtomicI64::new(value),
            notifier: FlushNotifier::default(),
        })
    }

    /// Path of the checkpoint file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&self) -> i64 {
        self.last_flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.last.store(value, Ordering::Release);
    }

    fn flush(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut file = self.file.lock().expect("lock is poisoned");

        let value = self.last.load(Ordering::Acquire);
        if value == self.last_flushed.load(Ordering::Acquire) {
            return Ok(());
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_i64::<LittleEndian>(value)?;
        file.sync_data()?;

        self.last_flushed.store(value, Ordering::Release);
        drop(file);

        self.notifier.notify();

        Ok(())
    }

    fn wait_for_flush(&self, timeout: Duration) -> bool {
        self.notifier.wait(timeout)
    }
}

/// Checkpoint that only lives in memory, used for tests and ephemeral databases
#[derive(Debug)]
pub struct InMemoryCheckpoint {
    name: &'static str,
    last: AtomicI64,
    last_flushed: AtomicI64,
    notifier: FlushNotifier,
}

impl InMemoryCheckpoint {
    /// Creates a new checkpoint with the given value
    #[must_use]
    pub fn new(name: &'static str, value: i64) -> Self {
        Self {
            name,
            last: AtomicI64::new(value),
            last_flushed: AtomicI64::new(value),
            notifier: FlushNotifier::default(),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&self) -> i64 {
        self.last_flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.last.store(value, Ordering::Release);
    }

    fn flush(&self) -> crate::Result<()> {
        self.last_flushed
            .store(self.last.load(Ordering::Acquire), Ordering::Release);
        self.notifier.notify();
        Ok(())
    }

    fn wait_for_flush(&self, timeout: Duration) -> bool {
        self.notifier.wait(timeout)
    }
}

/// Shared handle to a checkpoint
pub type CheckpointHandle = Arc<dyn Checkpoint>;

/// The set of checkpoints of a database
#[derive(Clone, Debug)]
pub struct Checkpoints {
    /// End of the durable log
    pub writer: CheckpointHandle,

    /// Chaser position
    pub chaser: CheckpointHandle,

    /// Last epoch position
    pub epoch: CheckpointHandle,

    /// Pending truncation position
    pub truncate: CheckpointHandle,

    /// Replicated position
    pub replication: CheckpointHandle,

    /// Durable index position
    pub index: CheckpointHandle,
}

impl Checkpoints {
    /// Opens (or creates) all checkpoint files in the given folder
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open<P: AsRef<Path>>(folder: P) -> crate::Result<Self> {
        let folder = folder.as_ref();

        let open = |name: CheckpointName| -> crate::Result<CheckpointHandle> {
            Ok(Arc::new(FileCheckpoint::open(
                folder.join(name.file_name()),
                name.as_str(),
                name.initial_value(),
            )?))
        };

        Ok(Self {
            writer: open(CheckpointName::Writer)?,
            chaser: open(CheckpointName::Chaser)?,
            epoch: open(CheckpointName::Epoch)?,
            truncate: open(CheckpointName::Truncate)?,
            replication: open(CheckpointName::Replication)?,
            index: open(CheckpointName::Index)?,
        })
    }

    /// Creates a set of in-memory checkpoints with their initial values
    #[must_use]
    pub fn in_memory() -> Self {
        let make = |name: CheckpointName| -> CheckpointHandle {
            Arc::new(InMemoryCheckpoint::new(name.as_str(), name.initial_value()))
        };

        Self {
            writer: make(CheckpointName::Writer),
            chaser: make(CheckpointName::Chaser),
            epoch: make(CheckpointName::Epoch),
            truncate: make(CheckpointName::Truncate),
            replication: make(CheckpointName::Replication),
            index: make(CheckpointName::Index),
        }
    }

    /// Returns the checkpoint with the given name
    #[must_use]
    pub fn get(&self, name: CheckpointName) -> &CheckpointHandle {
        match name {
            CheckpointName::Writer => &self.writer,
            CheckpointName::Chaser => &self.chaser,
            CheckpointName::Epoch => &self.epoch,
            CheckpointName::Truncate => &self.truncate,
            CheckpointName::Replication => &self.replication,
            CheckpointName::Index => &self.index,
        }
    }

    /// Flushes every checkpoint
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush_all(&self) -> crate::Result<()> {
        for name in CheckpointName::ALL {
            self.get(name).flush()?;
        }
        Ok(())
    }

    /// Fails if the chaser checkpoint is ahead of the writer checkpoint
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ReaderCheckpointHigherThanWriter`] on violation.
    pub fn validate_order(&self) -> crate::Result<()> {
        let writer = self.writer.read();
        let chaser = self.chaser.read();

        if chaser > writer {
            log::error!("Chaser checkpoint ({chaser}) is ahead of writer checkpoint ({writer})");

            return Err(crate::Error::ReaderCheckpointHigherThanWriter {
                checkpoint: self.chaser.name(),
                reader: chaser,
                writer,
            });
        }

        Ok(())
    }
}
