// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Writing a merged collection back into the local store.
//!
//! For each merged record, looked up locally by GlobalID:
//!
//! - found, merged tombstone: mark the local row deleted, fields untouched
//! - found, merged live: overwrite fields and clear the tombstone
//! - not found, merged tombstone: nothing (no local history to delete)
//! - not found, merged live: look for a local row with the same natural key
//!   that is not bound to any merged GlobalID (live rows before tombstones,
//!   then lowest LocalID). If there is one, re-point it to the incoming
//!   GlobalID, revive it and overwrite its fields. Otherwise insert a new row
//!   carrying the incoming GlobalID.
//!
//! The natural-key lookup is how rows created before they had a GlobalID
//! (seeded default categories, cards added offline) join their remote twin
//! instead of duplicating it. Candidates already bound to a GlobalID present
//! in the merged map are never re-pointed, so two same-named remote records
//! cannot pull one local row back and forth between syncs.
//!
//! Rows whose stored state already equals the merged result are not written.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, instrument, warn};

use crate::metrics;
use crate::month::YearMonth;
use crate::record::{
    Collection, CollectionMap, GlobalId, Imported, Instrument, InstrumentRefs, LocalId, Payload,
    Record,
};
use crate::store::{LocalStore, StoreError};

/// Two-way map between local and global instrument ids.
#[derive(Debug, Clone, Default)]
pub struct InstrumentIndex {
    to_global: HashMap<LocalId, GlobalId>,
    to_local: HashMap<GlobalId, LocalId>,
}

impl InstrumentIndex {
    /// Index every instrument row that has a GlobalID, tombstones included.
    pub async fn load<L: LocalStore>(store: &L) -> Result<Self, StoreError> {
        let rows = store.fetch_all::<Instrument>().await?;
        Ok(Self::from_pairs(
            rows.into_iter()
                .filter_map(|r| r.global_id.map(|gid| (r.local_id, gid))),
        ))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (LocalId, GlobalId)>) -> Self {
        let mut index = Self::default();
        for (local, global) in pairs {
            index.bind(local, global);
        }
        index
    }

    /// Add or replace a binding.
    pub fn bind(&mut self, local: LocalId, global: GlobalId) {
        if let Some(old) = self.to_global.insert(local, global.clone()) {
            self.to_local.remove(&old);
        }
        self.to_local.insert(global, local);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.to_global.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_global.is_empty()
    }
}

impl InstrumentRefs for InstrumentIndex {
    fn export(&self, local: LocalId) -> Option<GlobalId> {
        self.to_global.get(&local).cloned()
    }

    fn import(&self, global: &GlobalId) -> Option<LocalId> {
        self.to_local.get(global).copied()
    }
}

/// What applying one (or several) merged collections did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub tombstoned: usize,
    /// Rows adopted by natural key and re-pointed to a merged GlobalID.
    pub reconciled: usize,
    pub unchanged: usize,
    /// Merged tombstones with no local row.
    pub skipped: usize,
    /// Tombstones refused because the row is a protected default category.
    pub protected: usize,
    /// Live records whose instrument reference did not resolve (stored as cash).
    pub dangling_refs: usize,
    /// Months whose ledger entries were inserted, changed or tombstoned.
    pub touched_months: BTreeSet<YearMonth>,
}

impl ApplyReport {
    /// Rows written.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.tombstoned + self.reconciled
    }

    pub fn absorb(&mut self, other: ApplyReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.tombstoned += other.tombstoned;
        self.reconciled += other.reconciled;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.protected += other.protected;
        self.dangling_refs += other.dangling_refs;
        self.touched_months.extend(other.touched_months);
    }

    fn touch(&mut self, month: Option<YearMonth>) {
        if let Some(month) = month {
            self.touched_months.insert(month);
        }
    }

    fn record_metrics(&self, collection: Collection) {
        metrics::record_applied(collection, "inserted", self.inserted);
        metrics::record_applied(collection, "updated", self.updated);
        metrics::record_applied(collection, "tombstoned", self.tombstoned);
        metrics::record_applied(collection, "reconciled", self.reconciled);
        metrics::record_applied(collection, "unchanged", self.unchanged);
        metrics::record_applied(collection, "protected", self.protected);
    }
}

/// Applies merged collections to one local store.
pub struct ApplyCollection<'a, L> {
    store: &'a L,
    protected_category: &'a str,
}

impl<'a, L: LocalStore> ApplyCollection<'a, L> {
    /// `protected_category` names the default category (of either kind) that
    /// must never be tombstoned.
    pub fn new(store: &'a L, protected_category: &'a str) -> Self {
        Self {
            store,
            protected_category,
        }
    }

    #[instrument(skip_all, fields(collection = %P::COLLECTION, records = merged.len()))]
    pub async fn apply<P: Payload>(
        &self,
        merged: &CollectionMap<P::Doc>,
        refs: &dyn InstrumentRefs,
    ) -> Result<ApplyReport, StoreError> {
        let mut rows = self.store.fetch_all::<P>().await?;
        rows.sort_by_key(|r| r.local_id);

        let mut by_global: HashMap<GlobalId, Record<P>> = HashMap::new();
        let mut unbound: BTreeMap<String, Vec<Record<P>>> = BTreeMap::new();
        for row in rows {
            let bound_to_merged = row.global_id.as_ref().is_some_and(|g| merged.contains_key(g));
            if let Some(gid) = row.global_id.clone() {
                by_global.insert(gid, row.clone());
            }
            if !bound_to_merged {
                if let Some(key) = row.payload.natural_key() {
                    unbound.entry(key).or_default().push(row);
                }
            }
        }
        // Live candidates first, then oldest.
        for candidates in unbound.values_mut() {
            candidates.sort_by_key(|r| (r.is_deleted, r.local_id));
        }

        let mut report = ApplyReport::default();
        for (gid, incoming) in merged {
            let Imported { payload, dangling_ref } = P::from_doc(incoming.doc.clone(), refs);
            if dangling_ref && !incoming.is_deleted {
                debug!(global_id = %gid, "Instrument reference unresolved, storing as cash");
                report.dangling_refs += 1;
            }

            if let Some(local) = by_global.get(gid) {
                self.apply_existing(local, payload, incoming.is_deleted, &mut report)
                    .await?;
                continue;
            }
            if incoming.is_deleted {
                report.skipped += 1;
                continue;
            }

            let candidate = payload
                .natural_key()
                .and_then(|key| unbound.get_mut(&key))
                .and_then(|rows| (!rows.is_empty()).then(|| rows.remove(0)));
            match candidate {
                Some(local) => self.adopt(local, gid, payload, &mut report).await?,
                None => {
                    let month = payload.ledger_month();
                    self.store.insert(Some(gid.clone()), payload).await?;
                    report.inserted += 1;
                    report.touch(month);
                }
            }
        }

        report.record_metrics(P::COLLECTION);
        debug!(
            inserted = report.inserted,
            updated = report.updated,
            tombstoned = report.tombstoned,
            reconciled = report.reconciled,
            unchanged = report.unchanged,
            "Applied merged collection"
        );
        Ok(report)
    }

    fn is_protected<P: Payload>(&self, payload: &P) -> bool {
        payload
            .as_category()
            .is_some_and(|c| c.name == self.protected_category)
    }

    async fn apply_existing<P: Payload>(
        &self,
        local: &Record<P>,
        payload: P,
        deleted: bool,
        report: &mut ApplyReport,
    ) -> Result<(), StoreError> {
        if deleted {
            if local.is_deleted {
                report.unchanged += 1;
            } else if self.is_protected(&local.payload) {
                warn!(
                    local_id = %local.local_id,
                    name = self.protected_category,
                    "Refusing to tombstone protected default category"
                );
                report.protected += 1;
            } else {
                self.store.mark_deleted::<P>(local.local_id).await?;
                report.tombstoned += 1;
                report.touch(local.payload.ledger_month());
            }
            return Ok(());
        }

        if !local.is_deleted && local.payload == payload {
            report.unchanged += 1;
            return Ok(());
        }
        if !local.is_deleted
            && self.is_protected(&local.payload)
            && local.payload.natural_key() != payload.natural_key()
        {
            warn!(
                local_id = %local.local_id,
                name = self.protected_category,
                "Refusing to rename protected default category"
            );
            report.protected += 1;
            return Ok(());
        }
        report.touch(local.payload.ledger_month());
        report.touch(payload.ledger_month());
        if local.payload != payload {
            self.store.update_fields(local.local_id, payload).await?;
        }
        if local.is_deleted {
            self.store.set_deleted::<P>(local.local_id, false).await?;
        }
        report.updated += 1;
        Ok(())
    }

    async fn adopt<P: Payload>(
        &self,
        local: Record<P>,
        gid: &GlobalId,
        payload: P,
        report: &mut ApplyReport,
    ) -> Result<(), StoreError> {
        debug!(
            local_id = %local.local_id,
            previous = ?local.global_id,
            global_id = %gid,
            "Reconciling local record with remote twin"
        );
        self.store
            .assign_global_id::<P>(local.local_id, gid.clone())
            .await?;
        report.touch(local.payload.ledger_month());
        report.touch(payload.ledger_month());
        if local.payload != payload {
            self.store.update_fields(local.local_id, payload).await?;
        }
        if local.is_deleted {
            self.store.set_deleted::<P>(local.local_id, false).await?;
        }
        report.reconciled += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Category, CategoryKind, EntryKind, LedgerEntry, NoRefs, SnapshotRecord};
    use crate::store::MemoryLocalStore;
    use chrono::NaiveDate;

    const OTHER: &str = "Other";

    fn food() -> Category {
        Category::new("Food", CategoryKind::Expense)
    }

    fn card(name: &str) -> Instrument {
        Instrument {
            name: name.into(),
            credit_limit: "5000".parse().unwrap(),
            closing_day: 20,
            color_tag: "blue".into(),
        }
    }

    fn expense(amount: &str, instrument: Option<GlobalId>) -> SnapshotRecord<crate::record::LedgerDoc> {
        SnapshotRecord::live(LedgerEntry {
            kind: EntryKind::Expense,
            description: "lunch".into(),
            amount: amount.parse().unwrap(),
            category: "Food".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 9)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            instrument,
        })
    }

    fn one<D>(gid: &str, record: SnapshotRecord<D>) -> CollectionMap<D> {
        CollectionMap::from([(GlobalId::new(gid), record)])
    }

    #[tokio::test]
    async fn test_collision_adopts_legacy_record() {
        let store = MemoryLocalStore::new();
        let legacy = store.insert(None, food().with_keywords(&["rice"])).await.unwrap();

        let applier = ApplyCollection::new(&store, OTHER);
        let report = applier
            .apply::<Category>(&one("abc", SnapshotRecord::live(food())), &NoRefs)
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.inserted, 0);
        let rows = store.fetch_all::<Category>().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].local_id, legacy);
        assert_eq!(rows[0].global_id, Some(GlobalId::new("abc")));
        assert!(rows[0].payload.keywords.is_empty());
    }

    #[tokio::test]
    async fn test_collision_lookup_includes_tombstones() {
        let store = MemoryLocalStore::new();
        let old = store.insert(None, card("Blue")).await.unwrap();
        store.mark_deleted::<Instrument>(old).await.unwrap();

        let applier = ApplyCollection::new(&store, OTHER);
        applier
            .apply::<Instrument>(&one("card-1", SnapshotRecord::live(card("Blue"))), &NoRefs)
            .await
            .unwrap();

        let row = store.fetch::<Instrument>(old).await.unwrap().unwrap();
        assert!(row.is_live());
        assert_eq!(row.global_id, Some(GlobalId::new("card-1")));
        assert_eq!(store.len(Collection::Instruments), 1);
    }

    #[tokio::test]
    async fn test_same_named_remote_records_do_not_steal_bound_rows() {
        let store = MemoryLocalStore::new();
        store.insert(None, food()).await.unwrap();

        let mut merged = CollectionMap::new();
        merged.insert(GlobalId::new("a"), SnapshotRecord::live(food()));
        merged.insert(GlobalId::new("b"), SnapshotRecord::live(food()));

        let applier = ApplyCollection::new(&store, OTHER);
        let first = applier.apply::<Category>(&merged, &NoRefs).await.unwrap();
        assert_eq!((first.reconciled, first.inserted), (1, 1));

        let second = applier.apply::<Category>(&merged, &NoRefs).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 2);
    }

    #[tokio::test]
    async fn test_unknown_tombstone_is_not_materialized() {
        let store = MemoryLocalStore::new();
        let applier = ApplyCollection::new(&store, OTHER);
        let report = applier
            .apply::<Category>(&one("gone", SnapshotRecord::tombstone(food())), &NoRefs)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_leaves_fields_untouched() {
        let store = MemoryLocalStore::new();
        let id = store.insert(Some(GlobalId::new("abc")), food()).await.unwrap();

        let renamed = Category::new("Groceries", CategoryKind::Expense);
        let applier = ApplyCollection::new(&store, OTHER);
        applier
            .apply::<Category>(&one("abc", SnapshotRecord::tombstone(renamed)), &NoRefs)
            .await
            .unwrap();

        let row = store.fetch::<Category>(id).await.unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.payload.name, "Food");
    }

    #[tokio::test]
    async fn test_live_merge_revives_and_overwrites() {
        let store = MemoryLocalStore::new();
        let id = store.insert(Some(GlobalId::new("abc")), food()).await.unwrap();
        store.mark_deleted::<Category>(id).await.unwrap();

        let renamed = Category::new("Groceries", CategoryKind::Expense);
        let applier = ApplyCollection::new(&store, OTHER);
        let report = applier
            .apply::<Category>(&one("abc", SnapshotRecord::live(renamed.clone())), &NoRefs)
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        let row = store.fetch::<Category>(id).await.unwrap().unwrap();
        assert!(row.is_live());
        assert_eq!(row.payload, renamed);
    }

    #[tokio::test]
    async fn test_protected_category_is_never_tombstoned() {
        let store = MemoryLocalStore::new();
        let other = Category::new(OTHER, CategoryKind::Expense);
        let id = store.insert(Some(GlobalId::new("o")), other.clone()).await.unwrap();

        let applier = ApplyCollection::new(&store, OTHER);
        let report = applier
            .apply::<Category>(&one("o", SnapshotRecord::tombstone(other)), &NoRefs)
            .await
            .unwrap();

        assert_eq!(report.protected, 1);
        assert!(store.fetch::<Category>(id).await.unwrap().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_protected_category_is_never_renamed() {
        let store = MemoryLocalStore::new();
        let other = Category::new(OTHER, CategoryKind::Expense);
        let id = store.insert(Some(GlobalId::new("o")), other.clone()).await.unwrap();

        let applier = ApplyCollection::new(&store, OTHER);
        let renamed = Category::new("Misc", CategoryKind::Expense);
        let report = applier
            .apply::<Category>(&one("o", SnapshotRecord::live(renamed)), &NoRefs)
            .await
            .unwrap();
        assert_eq!(report.protected, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(store.fetch::<Category>(id).await.unwrap().unwrap().payload, other);

        // Same name and kind with new keywords is an ordinary update.
        let retagged = other.clone().with_keywords(&["misc"]);
        let report = applier
            .apply::<Category>(&one("o", SnapshotRecord::live(retagged.clone())), &NoRefs)
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(store.fetch::<Category>(id).await.unwrap().unwrap().payload, retagged);
    }

    #[tokio::test]
    async fn test_ledger_resolves_instrument_refs() {
        let store = MemoryLocalStore::new();
        let card_id = store.insert(Some(GlobalId::new("card-1")), card("Blue")).await.unwrap();
        let index = InstrumentIndex::load(&store).await.unwrap();

        let mut merged = CollectionMap::new();
        merged.insert(GlobalId::new("e1"), expense("120", Some(GlobalId::new("card-1"))));
        merged.insert(GlobalId::new("e2"), expense("80", Some(GlobalId::new("card-x"))));

        let applier = ApplyCollection::new(&store, OTHER);
        let report = applier.apply::<LedgerEntry>(&merged, &index).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.dangling_refs, 1);
        assert_eq!(
            report.touched_months,
            BTreeSet::from([YearMonth::new(2024, 3).unwrap()])
        );

        let e1 = store
            .fetch_by_global_id::<LedgerEntry>(&GlobalId::new("e1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e1.payload.instrument, Some(card_id));
        let e2 = store
            .fetch_by_global_id::<LedgerEntry>(&GlobalId::new("e2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e2.payload.instrument, None);
    }

    #[tokio::test]
    async fn test_reapply_writes_nothing() {
        let store = MemoryLocalStore::new();
        let applier = ApplyCollection::new(&store, OTHER);
        let merged = one("e1", expense("120", None));

        applier.apply::<LedgerEntry>(&merged, &NoRefs).await.unwrap();
        let generation = store.generation();
        let report = applier.apply::<LedgerEntry>(&merged, &NoRefs).await.unwrap();

        assert_eq!(report.writes(), 0);
        assert_eq!(report.unchanged, 1);
        assert!(report.touched_months.is_empty());
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_instrument_index_rebind() {
        let mut index = InstrumentIndex::from_pairs([(LocalId(1), GlobalId::new("a"))]);
        index.bind(LocalId(1), GlobalId::new("b"));
        assert_eq!(index.export(LocalId(1)), Some(GlobalId::new("b")));
        assert_eq!(index.import(&GlobalId::new("a")), None);
        assert_eq!(index.import(&GlobalId::new("b")), Some(LocalId(1)));
        assert_eq!(index.len(), 1);
    }
}
