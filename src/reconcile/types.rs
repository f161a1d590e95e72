//! Public types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::apply::ApplyReport;
use crate::merge::MergeStats;
use crate::record::Collection;
use crate::remote::{DataShapeError, TransportError};
use crate::rollover::RolloverReport;
use crate::store::{PurgeStats, StoreError};

/// Reconciler progress.
///
/// Use [`super::Reconciler::state()`] to check the current phase or
/// [`super::Reconciler::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// No operation running
    Idle,
    /// Reading the remote snapshot
    Fetching,
    /// Assigning identities and merging per collection
    Merging,
    /// Writing the snapshot to the remote
    Pushing,
    /// Writing merged collections into the local store
    Applying,
    /// Refreshing the balance-forward cascade
    RollingOver,
    /// Removing published tombstones
    Purging,
    /// The last operation failed; local state is as it was before it
    Failed,
}

impl ReconcileState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Fetching => "Fetching",
            Self::Merging => "Merging",
            Self::Pushing => "Pushing",
            Self::Applying => "Applying",
            Self::RollingOver => "RollingOver",
            Self::Purging => "Purging",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Metrics label for the failure.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Store(_) => "store_error",
        }
    }
}

/// Outcome of one bidirectional sync.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub merge: BTreeMap<Collection, MergeStats>,
    /// GlobalIDs minted for local records that had none
    pub identities_assigned: usize,
    pub applied: ApplyReport,
    /// Malformed remote records, skipped for apply and pushed back untouched
    pub warnings: Vec<DataShapeError>,
    pub rollover: RolloverReport,
    pub purge: Option<PurgeStats>,
}

/// Outcome of a local-to-remote overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub identities_assigned: usize,
    /// Records written per collection, tombstones included
    pub pushed: BTreeMap<Collection, usize>,
}

/// Outcome of a remote-to-local overwrite.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    /// Local rows dropped before applying the remote snapshot
    pub cleared: usize,
    pub applied: ApplyReport,
    pub warnings: Vec<DataShapeError>,
    /// Default categories re-seeded after the overwrite
    pub seeded: usize,
    pub rollover: RolloverReport,
}

/// Live record counts on each side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionCounts {
    pub local: usize,
    pub remote: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareReport {
    pub collections: BTreeMap<Collection, CollectionCounts>,
}

impl CompareReport {
    #[must_use]
    pub fn get(&self, collection: Collection) -> CollectionCounts {
        self.collections.get(&collection).copied().unwrap_or_default()
    }

    /// Both sides hold the same number of live records in every collection.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.collections.values().all(|c| c.local == c.remote)
    }
}

impl fmt::Display for CompareReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (collection, counts)) in self.collections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{collection}: Local={} / Remote={}",
                counts.local, counts.remote
            )?;
        }
        Ok(())
    }
}
