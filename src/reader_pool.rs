// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{chunk_db::ChunkDb, reader::TransactionFileReader};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

pub struct ReaderPoolInner {
    readers: Mutex<Vec<TransactionFileReader>>,

    /// Signalled when a lease is returned
    returned: Condvar,

    capacity: usize,
}

/// A bounded pool of log readers
///
/// The pool never grows: leasing blocks (or fails, see [`ReaderPool::try_lease`])
/// while all readers are in use.
#[derive(Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct ReaderPool(Arc<ReaderPoolInner>);

impl std::ops::Deref for ReaderPool {
    type Target = ReaderPoolInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ReaderPool {
    /// Creates a pool of `capacity` readers
    #[must_use]
    pub fn new(db: &Arc<ChunkDb>, capacity: usize) -> Self {
        let capacity = capacity.max(1);

        let readers = (0..capacity)
            .map(|_| TransactionFileReader::new(db.clone(), 0))
            .collect();

        Self(Arc::new(ReaderPoolInner {
            readers: Mutex::new(readers),
            returned: Condvar::new(),
            capacity,
        }))
    }

    fn lock_readers(&self) -> MutexGuard<'_, Vec<TransactionFileReader>> {
        #[allow(clippy::expect_used)]
        self.readers.lock().expect("lock is poisoned")
    }

    fn wrap(&self, reader: TransactionFileReader) -> ReaderLease {
        ReaderLease {
            pool: self.clone(),
            reader: Some(reader),
        }
    }

    /// Total amount of readers
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Amount of readers that are not leased
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock_readers().len()
    }

    /// Leases a reader, blocking until one is available
    ///
    /// The reader is returned to the pool when the lease is dropped.
    #[must_use]
    pub fn lease(&self) -> ReaderLease {
        let mut readers = self.lock_readers();

        loop {
            if let Some(reader) = readers.pop() {
                return self.wrap(reader);
            }

            #[allow(clippy::expect_used)]
            let guard = self.returned.wait(readers).expect("lock is poisoned");
            readers = guard;
        }
    }

    /// Leases a reader if one is available right now
    #[must_use]
    pub fn try_lease(&self) -> Option<ReaderLease> {
        let reader = self.lock_readers().pop()?;
        Some(self.wrap(reader))
    }

    /// Leases a reader, waiting at most `timeout` for one to be returned
    ///
    /// Returns `None` if the pool stayed exhausted.
    #[must_use]
    pub fn lease_timeout(&self, timeout: Duration) -> Option<ReaderLease> {
        #[allow(clippy::expect_used)]
        let (mut readers, _) = self
            .returned
            .wait_timeout_while(self.lock_readers(), timeout, |readers| readers.is_empty())
            .expect("lock is poisoned");

        let reader = readers.pop()?;
        drop(readers);

        Some(self.wrap(reader))
    }
}

/// A reader leased from a [`ReaderPool`]
pub struct ReaderLease {
    pool: ReaderPool,
    reader: Option<TransactionFileReader>,
}

impl std::ops::Deref for ReaderLease {
    type Target = TransactionFileReader;

    fn deref(&self) -> &Self::Target {
        #[allow(clippy::expect_used)]
        self.reader.as_ref().expect("reader is only taken on drop")
    }
}

impl std::ops::DerefMut for ReaderLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        #[allow(clippy::expect_used)]
        self.reader.as_mut().expect("reader is only taken on drop")
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.lock_readers().push(reader);
            self.pool.returned.notify_one();
        }
    }
}
