// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Hashes a stream ID to the 64-bit key used in the index
///
/// Different streams may collide, so readers need to check the stream ID
/// of the record an index entry points to.
#[must_use]
pub fn stream_hash(stream_id: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(stream_id.as_bytes())
}
