// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Chunkstore is an embeddable, append-only event log written in Rust. It features:
//!
//! - A transaction log split into fixed-size chunk files, with MD5-verified footers
//! - Durable checkpoints (writer, chaser, truncate, index, ...)
//! - Optional chunk transforms (default = identity, `LZ4` with the `lz4` feature)
//! - A stream index built from memtables and levelled, immutable index tables
//! - Automatic background index flushing and merging
//! - Chunk scavenging and archive catch-up
//!
//! It is not:
//!
//! - a standalone server
//! - a general purpose key-value store: events are only looked up by `(stream, event number)`
//!
//! ```
//! use chunkstore::{Config, EventData};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(&folder).open()?;
//!
//! // Append an event: it gets the number `expected_version + 1`
//! db.append("orders", -1, EventData::new("placed", b"hello"))?;
//!
//! // Make it durable, and wait for the chaser to index it
//! db.flush(true)?;
//! db.wait_for_indexing()?;
//!
//! let event = db.read_event("orders", 0)?;
//! assert!(event.is_some());
//! #
//! # Ok::<_, chunkstore::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Catch-up from an archive of completed chunks
pub mod archive;

mod background_worker;

/// Follows the durable end of the log
pub mod chaser;

/// Durable log positions
pub mod checkpoint;

/// Chunk files of the transaction log
pub mod chunk;

/// The chunked transaction log
pub mod chunk_db;

mod config;
mod db;
mod descriptor_table;
mod error;
mod file;

/// Stream index: memtables, index tables and the table map
pub mod index;

mod path;
mod poison_dart;

/// Sequential and positional log readers
pub mod reader;

/// Bounded pool of log readers
pub mod reader_pool;

/// Log records and their encoding
pub mod record;

/// Rewriting of completed chunks
pub mod scavenge;

mod stop_signal;
mod version;

/// Appends records to the log
pub mod writer;

pub use {
    chunk::transform::ChunkTransform,
    config::Config,
    db::{Database, EventData, ResolvedEvent},
    error::{CorruptIndexError, DecodeError, Error, InvalidFileError, Result},
    record::{LogPosition, Slice},
    stop_signal::StopSignal,
    version::{FileType, Version},
};
