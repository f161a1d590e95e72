// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! GlobalID backfill and local snapshot export.
//!
//! Local rows without a GlobalID (seeded categories, cards added offline,
//! balance-forward entries written by the cascade) cannot be merged until
//! they have one. Planning happens in memory: nothing is written until the
//! push succeeds, so a failed push leaves the store as it was.
//!
//! A live category or instrument whose natural key matches a live remote
//! record that no local row is bound to is *adopted*: it takes the remote
//! GlobalID through collision reconciliation during apply and is left out of
//! the exported snapshot. Every other live row gets a fresh GlobalID.
//! Tombstones without a GlobalID were never published and are not exported.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::apply::InstrumentIndex;
use crate::record::{
    Category, CollectionMap, GlobalId, Instrument, InstrumentRefs, LedgerEntry, LocalId, NoRefs,
    Payload, Record, RecurringSchedule, SnapshotRecord,
};
use crate::store::{LocalStore, StoreError};

/// Live remote records of one collection, by natural key.
#[derive(Debug, Default)]
pub(crate) struct RemoteTwins {
    by_key: HashMap<String, VecDeque<GlobalId>>,
}

impl RemoteTwins {
    /// No adoption: every unidentified row gets a fresh id.
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn from_remote<P: Payload>(records: &CollectionMap<P::Doc>) -> Self {
        let mut twins = Self::default();
        for (gid, record) in records {
            if record.is_deleted {
                continue;
            }
            if let Some(key) = P::from_doc(record.doc.clone(), &NoRefs).payload.natural_key() {
                twins.by_key.entry(key).or_default().push_back(gid.clone());
            }
        }
        twins
    }

    /// Take the first twin for `key` that no local row is bound to.
    fn claim(&mut self, key: &str, bound: &HashSet<&GlobalId>) -> Option<GlobalId> {
        let queue = self.by_key.get_mut(key)?;
        while let Some(gid) = queue.pop_front() {
            if !bound.contains(&gid) {
                return Some(gid);
            }
        }
        None
    }
}

/// GlobalIDs planned for one collection's unidentified live rows.
#[derive(Debug, Default)]
pub(crate) struct CollectionPlan {
    fresh: HashMap<LocalId, GlobalId>,
    adopted: HashMap<LocalId, GlobalId>,
}

impl CollectionPlan {
    pub(crate) fn build<P: Payload>(rows: &[Record<P>], twins: &mut RemoteTwins) -> Self {
        let bound: HashSet<&GlobalId> = rows.iter().filter_map(|r| r.global_id.as_ref()).collect();
        let mut plan = Self::default();

        let mut pending: Vec<&Record<P>> = rows
            .iter()
            .filter(|r| r.global_id.is_none() && r.is_live())
            .collect();
        pending.sort_by_key(|r| r.local_id);

        for row in pending {
            let twin = row
                .payload
                .natural_key()
                .and_then(|key| twins.claim(&key, &bound));
            match twin {
                Some(gid) => {
                    plan.adopted.insert(row.local_id, gid);
                }
                None => {
                    plan.fresh.insert(row.local_id, GlobalId::generate());
                }
            }
        }
        plan
    }

    /// Identity a row is exported under, `None` if it stays out of the snapshot.
    fn exported_id<'a, P>(&'a self, row: &'a Record<P>) -> Option<&'a GlobalId> {
        row.global_id.as_ref().or_else(|| self.fresh.get(&row.local_id))
    }

    /// The local snapshot: every identified row, tombstones included.
    pub(crate) fn export<P: Payload>(
        &self,
        rows: &[Record<P>],
        refs: &dyn InstrumentRefs,
    ) -> CollectionMap<P::Doc> {
        rows.iter()
            .filter_map(|row| {
                let gid = self.exported_id(row)?;
                let doc = row.payload.to_doc(refs);
                let record = if row.is_deleted {
                    SnapshotRecord::tombstone(doc)
                } else {
                    SnapshotRecord::live(doc)
                };
                Some((gid.clone(), record))
            })
            .collect()
    }

    /// Write the fresh ids. Adopted ids are bound by apply.
    pub(crate) async fn commit<P: Payload, L: LocalStore>(&self, store: &L) -> Result<usize, StoreError> {
        for (local_id, gid) in &self.fresh {
            store.assign_global_id::<P>(*local_id, gid.clone()).await?;
        }
        if !self.fresh.is_empty() || !self.adopted.is_empty() {
            debug!(
                collection = %P::COLLECTION,
                fresh = self.fresh.len(),
                adopted = self.adopted.len(),
                "Backfilled global ids"
            );
        }
        Ok(self.fresh.len())
    }
}

/// Every local row, typed per collection.
pub(crate) struct LocalRows {
    pub categories: Vec<Record<Category>>,
    pub instruments: Vec<Record<Instrument>>,
    pub ledger: Vec<Record<LedgerEntry>>,
    pub recurring: Vec<Record<RecurringSchedule>>,
}

impl LocalRows {
    pub(crate) async fn load<L: LocalStore>(store: &L) -> Result<Self, StoreError> {
        Ok(Self {
            categories: store.fetch_all().await?,
            instruments: store.fetch_all().await?,
            ledger: store.fetch_all().await?,
            recurring: store.fetch_all().await?,
        })
    }

    /// Live rows per collection.
    pub(crate) fn live_counts(&self) -> [usize; 4] {
        fn live<P>(rows: &[Record<P>]) -> usize {
            rows.iter().filter(|r| r.is_live()).count()
        }
        [
            live(&self.categories),
            live(&self.instruments),
            live(&self.ledger),
            live(&self.recurring),
        ]
    }

    pub(crate) fn plan(&self, mut categories: RemoteTwins, mut instruments: RemoteTwins) -> IdentityPlan {
        let instrument_plan = CollectionPlan::build(&self.instruments, &mut instruments);

        // Entries on a card awaiting adoption export the id it will adopt.
        let refs = InstrumentIndex::from_pairs(self.instruments.iter().filter_map(|row| {
            let gid = row
                .global_id
                .as_ref()
                .or_else(|| instrument_plan.fresh.get(&row.local_id))
                .or_else(|| instrument_plan.adopted.get(&row.local_id))?;
            Some((row.local_id, gid.clone()))
        }));

        IdentityPlan {
            categories: CollectionPlan::build(&self.categories, &mut categories),
            instruments: instrument_plan,
            ledger: CollectionPlan::build(&self.ledger, &mut RemoteTwins::none()),
            recurring: CollectionPlan::build(&self.recurring, &mut RemoteTwins::none()),
            refs,
        }
    }
}

/// Planned identities for every collection, plus the instrument map used to
/// export references.
pub(crate) struct IdentityPlan {
    pub categories: CollectionPlan,
    pub instruments: CollectionPlan,
    pub ledger: CollectionPlan,
    pub recurring: CollectionPlan,
    pub refs: InstrumentIndex,
}

impl IdentityPlan {
    pub(crate) fn fresh_count(&self) -> usize {
        self.categories.fresh.len()
            + self.instruments.fresh.len()
            + self.ledger.fresh.len()
            + self.recurring.fresh.len()
    }

    pub(crate) async fn commit<L: LocalStore>(&self, store: &L) -> Result<usize, StoreError> {
        let _quiet = store.change_feed().suppress();
        Ok(self.categories.commit::<Category, L>(store).await?
            + self.instruments.commit::<Instrument, L>(store).await?
            + self.ledger.commit::<LedgerEntry, L>(store).await?
            + self.recurring.commit::<RecurringSchedule, L>(store).await?)
    }
}
