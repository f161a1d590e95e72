use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Collection, GlobalId, LocalId, Payload, Record};
use super::notify::ChangeFeed;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{collection} record {id} not found")]
    NotFound { collection: Collection, id: LocalId },
    #[error("Local store backend error: {0}")]
    Backend(String),
    #[error("Corrupt {collection} row {id}: {reason}")]
    Corrupt {
        collection: Collection,
        id: LocalId,
        reason: String,
    },
}

/// Outcome of a purge sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Tombstoned rows physically removed
    pub removed: usize,
    /// Whether storage was compacted afterwards
    pub compacted: bool,
}

/// The embedded local store.
///
/// Reads return tombstoned rows too; callers filter with [`Record::is_live`].
/// Every mutation stamps the row with a new store generation and notifies the
/// [`ChangeFeed`]. Mutation discipline is the caller's: the store itself does
/// not serialize multi-step read-modify-write sequences.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn fetch_all<P: Payload>(&self) -> Result<Vec<Record<P>>, StoreError>;

    async fn fetch<P: Payload>(&self, id: LocalId) -> Result<Option<Record<P>>, StoreError>;

    async fn fetch_by_global_id<P: Payload>(
        &self,
        global_id: &GlobalId,
    ) -> Result<Option<Record<P>>, StoreError>;

    /// Insert a live row and return its new local id.
    async fn insert<P: Payload>(
        &self,
        global_id: Option<GlobalId>,
        payload: P,
    ) -> Result<LocalId, StoreError>;

    /// Overwrite the payload, leaving identity and tombstone state alone.
    async fn update_fields<P: Payload>(&self, id: LocalId, payload: P) -> Result<(), StoreError>;

    async fn set_deleted<P: Payload>(&self, id: LocalId, deleted: bool) -> Result<(), StoreError>;

    async fn mark_deleted<P: Payload>(&self, id: LocalId) -> Result<(), StoreError> {
        self.set_deleted::<P>(id, true).await
    }

    /// Bind (or re-point) a row to a global id.
    async fn assign_global_id<P: Payload>(
        &self,
        id: LocalId,
        global_id: GlobalId,
    ) -> Result<(), StoreError>;

    /// Hard-delete every row of one collection. Local ids are still never reused.
    async fn clear<P: Payload>(&self) -> Result<usize, StoreError>;

    /// Physically remove tombstoned rows across all collections, optionally
    /// only those whose revision is at or below `up_to_revision`, then compact.
    async fn purge(&self, up_to_revision: Option<u64>) -> Result<PurgeStats, StoreError>;

    /// Current store generation (the revision of the most recent write).
    fn generation(&self) -> u64;

    /// Highest generation known to have been published to the remote.
    async fn published_watermark(&self) -> Result<u64, StoreError>;

    async fn set_published_watermark(&self, generation: u64) -> Result<(), StoreError>;

    fn change_feed(&self) -> &ChangeFeed;
}
