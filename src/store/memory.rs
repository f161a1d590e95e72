//! In-memory local store.
//!
//! Each collection is a generation-tagged arena: rows are keyed by a
//! monotonically allocated [`LocalId`], indexed by [`GlobalId`], carry a
//! tombstone bit, and are stamped with the store generation of their last
//! write. [`LocalStore::purge`] is the compaction sweep.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::record::{AnyPayload, Collection, GlobalId, LocalId, Payload, Record};
use super::notify::ChangeFeed;
use super::traits::{LocalStore, PurgeStats, StoreError};

#[derive(Default)]
struct Arena {
    rows: BTreeMap<LocalId, Record<AnyPayload>>,
    by_global: HashMap<GlobalId, LocalId>,
    next_id: i64,
}

impl Arena {
    fn allocate(&mut self) -> LocalId {
        self.next_id += 1;
        LocalId(self.next_id)
    }

    fn row_mut(&mut self, collection: Collection, id: LocalId) -> Result<&mut Record<AnyPayload>, StoreError> {
        self.rows
            .get_mut(&id)
            .ok_or(StoreError::NotFound { collection, id })
    }
}

#[derive(Default)]
struct Tables {
    arenas: HashMap<Collection, Arena>,
    generation: u64,
    watermark: u64,
}

impl Tables {
    fn arena(&self, collection: Collection) -> Option<&Arena> {
        self.arenas.get(&collection)
    }

    fn arena_mut(&mut self, collection: Collection) -> &mut Arena {
        self.arenas.entry(collection).or_default()
    }

    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

pub struct MemoryLocalStore {
    tables: RwLock<Tables>,
    feed: ChangeFeed,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            feed: ChangeFeed::default(),
        }
    }

    /// Replace the change feed with one buffering `capacity` events per subscriber.
    #[must_use]
    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.feed = ChangeFeed::new(capacity);
        self
    }

    /// Rows (including tombstones) currently held for `collection`.
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.tables
            .read()
            .arena(collection)
            .map_or(0, |a| a.rows.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().arenas.values().all(|a| a.rows.is_empty())
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn typed<P: Payload>(row: &Record<AnyPayload>) -> Result<Record<P>, StoreError> {
    let payload = P::from_any(row.payload.clone()).ok_or_else(|| StoreError::Corrupt {
        collection: P::COLLECTION,
        id: row.local_id,
        reason: "payload stored under the wrong collection".into(),
    })?;
    Ok(Record {
        local_id: row.local_id,
        global_id: row.global_id.clone(),
        is_deleted: row.is_deleted,
        revision: row.revision,
        payload,
    })
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn fetch_all<P: Payload>(&self) -> Result<Vec<Record<P>>, StoreError> {
        let tables = self.tables.read();
        match tables.arena(P::COLLECTION) {
            Some(arena) => arena.rows.values().map(typed::<P>).collect(),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch<P: Payload>(&self, id: LocalId) -> Result<Option<Record<P>>, StoreError> {
        let tables = self.tables.read();
        tables
            .arena(P::COLLECTION)
            .and_then(|a| a.rows.get(&id))
            .map(typed::<P>)
            .transpose()
    }

    async fn fetch_by_global_id<P: Payload>(
        &self,
        global_id: &GlobalId,
    ) -> Result<Option<Record<P>>, StoreError> {
        let tables = self.tables.read();
        let Some(arena) = tables.arena(P::COLLECTION) else {
            return Ok(None);
        };
        arena
            .by_global
            .get(global_id)
            .and_then(|id| arena.rows.get(id))
            .map(typed::<P>)
            .transpose()
    }

    async fn insert<P: Payload>(
        &self,
        global_id: Option<GlobalId>,
        payload: P,
    ) -> Result<LocalId, StoreError> {
        let id = {
            let mut tables = self.tables.write();
            let revision = tables.bump();
            let arena = tables.arena_mut(P::COLLECTION);
            if let Some(gid) = global_id.as_ref() {
                if arena.by_global.contains_key(gid) {
                    return Err(StoreError::Backend(format!(
                        "global id {gid} already bound in {}",
                        P::COLLECTION
                    )));
                }
            }
            let id = arena.allocate();
            if let Some(gid) = global_id.clone() {
                arena.by_global.insert(gid, id);
            }
            arena.rows.insert(
                id,
                Record {
                    local_id: id,
                    global_id,
                    is_deleted: false,
                    revision,
                    payload: payload.into_any(),
                },
            );
            id
        };
        self.feed.notify(P::COLLECTION);
        Ok(id)
    }

    async fn update_fields<P: Payload>(&self, id: LocalId, payload: P) -> Result<(), StoreError> {
        {
            let mut tables = self.tables.write();
            let revision = tables.bump();
            let row = tables.arena_mut(P::COLLECTION).row_mut(P::COLLECTION, id)?;
            row.payload = payload.into_any();
            row.revision = revision;
        }
        self.feed.notify(P::COLLECTION);
        Ok(())
    }

    async fn set_deleted<P: Payload>(&self, id: LocalId, deleted: bool) -> Result<(), StoreError> {
        {
            let mut tables = self.tables.write();
            let revision = tables.bump();
            let row = tables.arena_mut(P::COLLECTION).row_mut(P::COLLECTION, id)?;
            row.is_deleted = deleted;
            row.revision = revision;
        }
        self.feed.notify(P::COLLECTION);
        Ok(())
    }

    async fn assign_global_id<P: Payload>(
        &self,
        id: LocalId,
        global_id: GlobalId,
    ) -> Result<(), StoreError> {
        {
            let mut tables = self.tables.write();
            let revision = tables.bump();
            let arena = tables.arena_mut(P::COLLECTION);
            if let Some(owner) = arena.by_global.get(&global_id) {
                if *owner != id {
                    return Err(StoreError::Backend(format!(
                        "global id {global_id} already bound to {owner} in {}",
                        P::COLLECTION
                    )));
                }
            }
            let row = arena.row_mut(P::COLLECTION, id)?;
            let previous = row.global_id.replace(global_id.clone());
            row.revision = revision;
            if let Some(previous) = previous {
                arena.by_global.remove(&previous);
            }
            arena.by_global.insert(global_id, id);
        }
        self.feed.notify(P::COLLECTION);
        Ok(())
    }

    async fn clear<P: Payload>(&self) -> Result<usize, StoreError> {
        let removed = {
            let mut tables = self.tables.write();
            tables.bump();
            let arena = tables.arena_mut(P::COLLECTION);
            let removed = arena.rows.len();
            arena.rows.clear();
            arena.by_global.clear();
            removed
        };
        if removed > 0 {
            self.feed.notify(P::COLLECTION);
        }
        Ok(removed)
    }

    async fn purge(&self, up_to_revision: Option<u64>) -> Result<PurgeStats, StoreError> {
        let mut tables = self.tables.write();
        let mut removed = 0;
        for arena in tables.arenas.values_mut() {
            let doomed: Vec<LocalId> = arena
                .rows
                .values()
                .filter(|r| r.is_deleted && up_to_revision.map_or(true, |cut| r.revision <= cut))
                .map(|r| r.local_id)
                .collect();
            for id in doomed {
                if let Some(row) = arena.rows.remove(&id) {
                    if let Some(gid) = row.global_id {
                        arena.by_global.remove(&gid);
                    }
                    removed += 1;
                }
            }
        }
        Ok(PurgeStats {
            removed,
            compacted: removed > 0,
        })
    }

    fn generation(&self) -> u64 {
        self.tables.read().generation
    }

    async fn published_watermark(&self) -> Result<u64, StoreError> {
        Ok(self.tables.read().watermark)
    }

    async fn set_published_watermark(&self, generation: u64) -> Result<(), StoreError> {
        self.tables.write().watermark = generation;
        Ok(())
    }

    fn change_feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Category, CategoryKind, Instrument};

    fn food() -> Category {
        Category::new("Food", CategoryKind::Expense)
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryLocalStore::new();
        assert!(store.is_empty());
        assert_eq!(store.generation(), 0);
        let rows = store.fetch_all::<Category>().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_insert_and_fetch_by_global_id() {
        let store = MemoryLocalStore::new();
        let id = store.insert(Some(GlobalId::new("g-1")), food()).await.unwrap();

        let row = store
            .fetch_by_global_id::<Category>(&GlobalId::new("g-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.local_id, id);
        assert_eq!(row.payload, food());
        assert!(row.is_live());
        assert_eq!(row.revision, store.generation());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = MemoryLocalStore::new();
        store.insert(Some(GlobalId::new("g-1")), food()).await.unwrap();

        let cards = store
            .fetch_by_global_id::<Instrument>(&GlobalId::new("g-1"))
            .await
            .unwrap();
        assert!(cards.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_global_id_rejected() {
        let store = MemoryLocalStore::new();
        store.insert(Some(GlobalId::new("g-1")), food()).await.unwrap();
        let result = store.insert(Some(GlobalId::new("g-1")), food()).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row_until_purge() {
        let store = MemoryLocalStore::new();
        let id = store.insert(None, food()).await.unwrap();

        store.mark_deleted::<Category>(id).await.unwrap();
        let row = store.fetch::<Category>(id).await.unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(store.len(Collection::Categories), 1);

        let stats = store.purge(None).await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.fetch::<Category>(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_respects_revision_cutoff() {
        let store = MemoryLocalStore::new();
        let early = store.insert(None, food()).await.unwrap();
        store.mark_deleted::<Category>(early).await.unwrap();
        let cutoff = store.generation();

        let late = store
            .insert(None, Category::new("Fun", CategoryKind::Expense))
            .await
            .unwrap();
        store.mark_deleted::<Category>(late).await.unwrap();

        let stats = store.purge(Some(cutoff)).await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.fetch::<Category>(early).await.unwrap().is_none());
        assert!(store.fetch::<Category>(late).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_ids_never_reused() {
        let store = MemoryLocalStore::new();
        let first = store.insert(None, food()).await.unwrap();
        store.mark_deleted::<Category>(first).await.unwrap();
        store.purge(None).await.unwrap();
        store.clear::<Category>().await.unwrap();

        let second = store.insert(None, food()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_assign_global_id_repoints_index() {
        let store = MemoryLocalStore::new();
        let id = store.insert(Some(GlobalId::new("old")), food()).await.unwrap();

        store
            .assign_global_id::<Category>(id, GlobalId::new("new"))
            .await
            .unwrap();

        assert!(store
            .fetch_by_global_id::<Category>(&GlobalId::new("old"))
            .await
            .unwrap()
            .is_none());
        let row = store
            .fetch_by_global_id::<Category>(&GlobalId::new("new"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.local_id, id);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = MemoryLocalStore::new();
        let result = store.update_fields(LocalId(42), food()).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_writes_notify_subscribers() {
        let store = MemoryLocalStore::new();
        let mut rx = store.change_feed().subscribe();
        store.insert(None, food()).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert!(event.collections.contains(&Collection::Categories));
    }

    #[tokio::test]
    async fn test_watermark_round_trip() {
        let store = MemoryLocalStore::new();
        store.set_published_watermark(9).await.unwrap();
        assert_eq!(store.published_watermark().await.unwrap(), 9);
    }
}
