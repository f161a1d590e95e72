// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Whole-record merge of one collection.
//!
//! Start from the remote map, then fold in every local record:
//!
//! | remote      | local     | result |
//! |-------------|-----------|--------|
//! | absent      | any       | local  |
//! | tombstone   | any       | remote |
//! | live        | tombstone | local  |
//! | live        | live      | local  |
//!
//! Delete dominates whenever either side is deleted, otherwise local wins.
//! There are no per-field timestamps, so two offline edits to the same
//! record on different devices do not both survive: the last device to sync
//! overwrites the other. Collections are merged independently.

use crate::record::CollectionMap;

/// What a merge did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records only the local side had
    pub local_only: usize,
    /// Remote tombstones that overrode a local record
    pub remote_deletes: usize,
    /// Local tombstones pushed over a live remote record
    pub local_deletes: usize,
    /// Live-vs-live pairs resolved to the local record
    pub local_overrides: usize,
}

/// Merge `local` into `remote`. Pure and deterministic.
#[must_use]
pub fn merge<D: Clone>(remote: &CollectionMap<D>, local: &CollectionMap<D>) -> CollectionMap<D> {
    merge_counted(remote, local).0
}

#[must_use]
pub fn merge_counted<D: Clone>(
    remote: &CollectionMap<D>,
    local: &CollectionMap<D>,
) -> (CollectionMap<D>, MergeStats) {
    let mut merged = remote.clone();
    let mut stats = MergeStats::default();

    for (gid, theirs) in local {
        match merged.get_mut(gid) {
            None => {
                stats.local_only += 1;
                merged.insert(gid.clone(), theirs.clone());
            }
            Some(existing) if existing.is_deleted => {
                if !theirs.is_deleted {
                    stats.remote_deletes += 1;
                }
            }
            Some(existing) => {
                if theirs.is_deleted {
                    stats.local_deletes += 1;
                } else {
                    stats.local_overrides += 1;
                }
                *existing = theirs.clone();
            }
        }
    }

    (merged, stats)
}
