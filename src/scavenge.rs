// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    chunk::{footer::PosMapEntry, header::ChunkHeader, naming::ChunkFileName, AppendResult, Chunk},
    chunk_db::ChunkDb,
    file::{fsync_directory, TEMP_FILE_EXT},
    record::LogRecord,
    stop_signal::StopSignal,
};
use std::{path::Path, sync::Arc};

/// Statistics of a scavenged chunk
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ScavengeResult {
    /// Records kept
    pub kept: usize,

    /// Records removed
    pub removed: usize,

    /// Data size before scavenging
    pub old_data_size: i64,

    /// Data size after scavenging
    pub new_data_size: i64,
}

fn remove_temp_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Failed to remove temporary chunk {path:?}: {e:?}");
    }
}

/// Rewrites a completed chunk, keeping only records that `keep` returns `true` for
///
/// The new chunk gets the next file version and is swapped in atomically.
/// Kept records retain their log positions through the position map of the new chunk.
///
/// # Errors
///
/// Returns [`crate::Error::Cancelled`] if the stop signal was sent, in which case the
/// original chunk stays in place.
pub fn scavenge_chunk<F: FnMut(&LogRecord) -> bool>(
    db: &ChunkDb,
    chunk_number: i32,
    mut keep: F,
    stop_signal: &StopSignal,
) -> crate::Result<Option<ScavengeResult>> {
    let Some(old) = db.manager().get_chunk(chunk_number) else {
        return Err(crate::Error::ChunkNotFound(i64::from(chunk_number)));
    };

    if !old.is_completed() {
        log::debug!("Not scavenging active chunk {chunk_number}");
        return Ok(None);
    }

    let Some(old_name) = old
        .path()
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(ChunkFileName::parse)
    else {
        return Err(crate::Error::BadChunkInDatabase {
            path: old.path().to_path_buf(),
            reason: "invalid chunk file name".into(),
        });
    };

    let new_name = ChunkFileName {
        number: old_name.number,
        version: old_name.version + 1,
    };

    let folder = db.manager().folder();
    let temp_path = folder.join(format!("{}.scavenge.{TEMP_FILE_EXT}", new_name.file_name()));
    let final_path = folder.join(new_name.file_name());

    log::info!("Scavenging {old:?} into {final_path:?}");

    let header = ChunkHeader {
        is_scavenged: true,
        ..*old.header()
    };

    let new = Chunk::create(
        &temp_path,
        header,
        db.config().alignment_size,
        db.config().descriptor_count,
    )?;

    let mut result = ScavengeResult {
        old_data_size: old.physical_data_size(),
        ..Default::default()
    };

    let mut pos_map = vec![];
    let mut offset = 0;

    let outcome = (|| -> crate::Result<()> {
        while let Some(record) = old.try_read_closest_forward(offset)? {
            if stop_signal.is_stopped() {
                return Err(crate::Error::Cancelled);
            }

            offset = record.next_offset();

            if !keep(&record.record) {
                result.removed += 1;
                continue;
            }

            // NOTE: Frames are copied as-is, so the transform does not need to be reapplied
            let physical = old.physical_offset_of(record.offset).ok_or_else(|| {
                crate::Error::BadChunkInDatabase {
                    path: old.path().to_path_buf(),
                    reason: format!("no position map entry for {}", record.offset),
                }
            })?;

            let Some(raw) = old.read_raw_frame(physical)? else {
                break;
            };

            match new.try_append_raw(&raw)? {
                AppendResult::Written { offset: actual, .. } => {
                    pos_map.push(PosMapEntry {
                        logical: record.offset as i32,
                        actual: actual as i32,
                    });
                    result.kept += 1;
                }
                AppendResult::ChunkFull => {
                    return Err(crate::Error::BadChunkInDatabase {
                        path: old.path().to_path_buf(),
                        reason: "scavenged data does not fit into chunk".into(),
                    });
                }
            }
        }

        new.complete(&pos_map, Some(old.logical_data_size()))?;

        Ok(())
    })();

    result.new_data_size = new.physical_data_size();
    drop(new);

    if let Err(e) = outcome {
        log::debug!("Scavenging chunk {chunk_number} aborted: {e:?}");
        remove_temp_file(&temp_path);
        return Err(e);
    }

    std::fs::rename(&temp_path, &final_path)?;

    // IMPORTANT: fsync folder on Unix
    fsync_directory(folder)?;

    let new = Chunk::open_completed(&final_path, true, db.config().descriptor_count)?;
    db.manager().switch_chunk(Arc::new(new));

    log::info!(
        "Scavenged chunk {chunk_number}: kept {}, removed {} records ({} -> {} bytes)",
        result.kept,
        result.removed,
        result.old_data_size,
        result.new_data_size,
    );

    Ok(Some(result))
}
