// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation orchestrator.
//!
//! The [`Reconciler`] drives every exchange between the local store and the
//! remote snapshot:
//!
//! - [`Reconciler::sync`]: fetch, merge, push, apply, refresh the cascade, purge
//! - [`Reconciler::force_push`]: overwrite the remote with the local state
//! - [`Reconciler::force_pull`]: overwrite the local state with the remote
//! - [`Reconciler::compare`]: live record counts on both sides, read-only
//! - [`Reconciler::check_connection`]
//!
//! # Sync sequence
//!
//! ```text
//!  fetch ──► plan ids ──► merge ×4 ──► push ──► commit ids ──► apply ×4 ──► cascade ──► purge
//!    │                                   │       (notifications suspended)
//!    └── TransportError: local untouched ┘
//! ```
//!
//! Everything after the fetch runs under the single-writer lock shared with
//! [`Ledger`], so no user edit lands between the local read and the apply.
//! Apply order is categories, instruments, ledger entries, recurring
//! schedules; the instrument map is rebuilt after instruments are applied.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledger_sync::{Ledger, LedgerSyncConfig, MemoryLocalStore, MemoryRemote, Reconciler};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default());
//! let reconciler = Reconciler::new(ledger, Arc::new(MemoryRemote::new()));
//!
//! let report = reconciler.sync().await?;
//! println!("applied {} writes", report.applied.writes());
//! # Ok(())
//! # }
//! ```

mod control;
mod identity;
mod types;

pub use control::{Command, CommandOutcome, UnknownCommand};
pub use types::{
    CollectionCounts, CompareReport, PullReport, PushReport, ReconcileError, ReconcileState,
    SyncReport,
};

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::apply::{ApplyCollection, ApplyReport, InstrumentIndex};
use crate::ledger::Ledger;
use crate::merge::merge_counted;
use crate::metrics::{self, LatencyTimer};
use crate::record::{
    Category, Collection, CollectionMap, Instrument, InstrumentRefs, LedgerDoc, LedgerEntry,
    NoRefs, Payload, Record, RecurringDoc, RecurringSchedule,
};
use crate::remote::{decode_collection, encode_collection, Decoded, RawSnapshot, RemoteStore, TransportError};
use crate::store::{LocalStore, StoreError};

use identity::{CollectionPlan, LocalRows, RemoteTwins};

pub struct Reconciler<L, R> {
    ledger: Ledger<L>,
    remote: Arc<R>,
    state: Arc<watch::Sender<ReconcileState>>,
    state_rx: watch::Receiver<ReconcileState>,
}

impl<L, R> Clone for Reconciler<L, R> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            remote: Arc::clone(&self.remote),
            state: Arc::clone(&self.state),
            state_rx: self.state_rx.clone(),
        }
    }
}

/// The four remote collections, decoded.
struct RemoteCollections {
    categories: Decoded<Category>,
    instruments: Decoded<Instrument>,
    ledger: Decoded<LedgerDoc>,
    recurring: Decoded<RecurringDoc>,
}

impl RemoteCollections {
    fn decode(raw: &RawSnapshot) -> Self {
        Self {
            categories: decode_collection::<Category>(raw),
            instruments: decode_collection::<Instrument>(raw),
            ledger: decode_collection::<LedgerEntry>(raw),
            recurring: decode_collection::<RecurringSchedule>(raw),
        }
    }
}

impl<L, R> Reconciler<L, R>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    pub fn new(ledger: Ledger<L>, remote: Arc<R>) -> Self {
        let (state_tx, state_rx) = watch::channel(ReconcileState::Idle);
        Self {
            ledger,
            remote,
            state: Arc::new(state_tx),
            state_rx,
        }
    }

    pub fn ledger(&self) -> &Ledger<L> {
        &self.ledger
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    #[must_use]
    pub fn state(&self) -> ReconcileState {
        *self.state_rx.borrow()
    }

    /// Watch progress of the running operation.
    pub fn state_receiver(&self) -> watch::Receiver<ReconcileState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ReconcileState) {
        metrics::set_reconcile_state(state.as_str());
        let _ = self.state.send(state);
    }

    fn finish<T>(&self, operation: &'static str, result: &Result<T, ReconcileError>) {
        match result {
            Ok(_) => {
                metrics::record_operation(operation, "success");
                self.set_state(ReconcileState::Idle);
            }
            Err(e) => {
                metrics::record_operation(operation, e.status());
                error!(operation, error = %e, "Reconcile operation failed");
                self.set_state(ReconcileState::Failed);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn check_connection(&self) -> Result<(), ReconcileError> {
        let _timer = LatencyTimer::new("check_connection");
        let result = self.remote.check_connection().await.map_err(ReconcileError::from);
        match &result {
            Ok(()) => metrics::record_operation("check_connection", "success"),
            Err(e) => metrics::record_operation("check_connection", e.status()),
        }
        result
    }

    /// Bidirectional merge. See the module docs for the sequence.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncReport, ReconcileError> {
        let _timer = LatencyTimer::new("sync");
        let result = self.run_sync().await;
        self.finish("sync", &result);
        if let Ok(report) = &result {
            info!(
                writes = report.applied.writes(),
                identities = report.identities_assigned,
                warnings = report.warnings.len(),
                rollover_writes = report.rollover.writes(),
                purged = report.purge.map_or(0, |p| p.removed),
                "Sync complete"
            );
        }
        result
    }

    /// Run [`Self::sync`] as a background task.
    pub fn spawn_sync(&self) -> JoinHandle<Result<SyncReport, ReconcileError>> {
        let this = self.clone();
        tokio::spawn(async move { this.sync().await })
    }

    async fn run_sync(&self) -> Result<SyncReport, ReconcileError> {
        self.set_state(ReconcileState::Fetching);
        let raw = self.remote.fetch_snapshot().await?;
        let remote = RemoteCollections::decode(&raw);

        let _writer = self.ledger.writer.lock().await;
        let store = &*self.ledger.store;

        self.set_state(ReconcileState::Merging);
        let rows = LocalRows::load(store).await?;
        let plan = rows.plan(
            RemoteTwins::from_remote::<Category>(&remote.categories.records),
            RemoteTwins::from_remote::<Instrument>(&remote.instruments.records),
        );

        let mut report = SyncReport {
            identities_assigned: plan.fresh_count(),
            ..SyncReport::default()
        };
        let mut outgoing = RawSnapshot::new();
        let categories = merge_collection(
            &rows.categories,
            &plan.categories,
            &NoRefs,
            remote.categories,
            &mut outgoing,
            &mut report,
        )?;
        let instruments = merge_collection(
            &rows.instruments,
            &plan.instruments,
            &NoRefs,
            remote.instruments,
            &mut outgoing,
            &mut report,
        )?;
        let ledger = merge_collection(
            &rows.ledger,
            &plan.ledger,
            &plan.refs,
            remote.ledger,
            &mut outgoing,
            &mut report,
        )?;
        let recurring = merge_collection(
            &rows.recurring,
            &plan.recurring,
            &plan.refs,
            remote.recurring,
            &mut outgoing,
            &mut report,
        )?;
        outgoing.last_update = Some(Utc::now());

        self.set_state(ReconcileState::Pushing);
        self.remote.put_snapshot(outgoing).await?;
        debug!("Merged snapshot pushed");

        self.set_state(ReconcileState::Applying);
        {
            let _quiet = store.change_feed().suppress();
            plan.commit(store).await?;
            report.applied = self
                .apply_all(&categories, &instruments, &ledger, &recurring)
                .await?;
        }

        // Everything up to here matches what the remote now holds.
        let cutoff = store.generation();
        store.set_published_watermark(cutoff).await?;

        if let Some(first) = report.applied.touched_months.first().copied() {
            self.set_state(ReconcileState::RollingOver);
            report.rollover = self.ledger.refresh_rollover(first.pred()).await?;
        }

        if self.ledger.config.purge_after_sync {
            self.set_state(ReconcileState::Purging);
            let stats = store.purge(Some(cutoff)).await?;
            metrics::record_purge(stats.removed);
            report.purge = Some(stats);
        }
        Ok(report)
    }

    /// Overwrite the remote with every identified local record.
    #[instrument(skip(self))]
    pub async fn force_push(&self) -> Result<PushReport, ReconcileError> {
        let _timer = LatencyTimer::new("push");
        let result = self.run_force_push().await;
        self.finish("push", &result);
        result
    }

    async fn run_force_push(&self) -> Result<PushReport, ReconcileError> {
        let _writer = self.ledger.writer.lock().await;
        let store = &*self.ledger.store;

        self.set_state(ReconcileState::Merging);
        let rows = LocalRows::load(store).await?;
        let plan = rows.plan(RemoteTwins::none(), RemoteTwins::none());

        let mut report = PushReport {
            identities_assigned: plan.fresh_count(),
            ..PushReport::default()
        };
        let mut outgoing = RawSnapshot::new();
        push_collection(
            &mut outgoing,
            &mut report,
            Collection::Categories,
            &plan.categories.export(&rows.categories, &NoRefs),
        )?;
        push_collection(
            &mut outgoing,
            &mut report,
            Collection::Instruments,
            &plan.instruments.export(&rows.instruments, &NoRefs),
        )?;
        push_collection(
            &mut outgoing,
            &mut report,
            Collection::Ledger,
            &plan.ledger.export(&rows.ledger, &plan.refs),
        )?;
        push_collection(
            &mut outgoing,
            &mut report,
            Collection::Recurring,
            &plan.recurring.export(&rows.recurring, &plan.refs),
        )?;
        outgoing.last_update = Some(Utc::now());

        self.set_state(ReconcileState::Pushing);
        self.remote.put_snapshot(outgoing).await?;

        plan.commit(store).await?;
        store.set_published_watermark(store.generation()).await?;
        info!(
            identities = report.identities_assigned,
            records = report.pushed.values().sum::<usize>(),
            "Local state pushed over remote"
        );
        Ok(report)
    }

    /// Replace the local collections with the remote snapshot.
    #[instrument(skip(self))]
    pub async fn force_pull(&self) -> Result<PullReport, ReconcileError> {
        let _timer = LatencyTimer::new("pull");
        let result = self.run_force_pull().await;
        self.finish("pull", &result);
        result
    }

    async fn run_force_pull(&self) -> Result<PullReport, ReconcileError> {
        self.set_state(ReconcileState::Fetching);
        let raw = self.remote.fetch_snapshot().await?;
        let remote = RemoteCollections::decode(&raw);

        let _writer = self.ledger.writer.lock().await;
        let store = &*self.ledger.store;

        self.set_state(ReconcileState::Applying);
        let mut report = PullReport::default();
        {
            let _quiet = store.change_feed().suppress();
            report.cleared = store.clear::<Category>().await?
                + store.clear::<Instrument>().await?
                + store.clear::<LedgerEntry>().await?
                + store.clear::<RecurringSchedule>().await?;
            report.applied = self
                .apply_all(
                    &remote.categories.records,
                    &remote.instruments.records,
                    &remote.ledger.records,
                    &remote.recurring.records,
                )
                .await?;
            report.seeded = self.ledger.ensure_default_categories_locked().await?;
        }
        for decoded in [
            remote.categories.warnings,
            remote.instruments.warnings,
            remote.ledger.warnings,
            remote.recurring.warnings,
        ] {
            if let Some(first) = decoded.first() {
                metrics::record_data_shape_warnings(first.collection, decoded.len());
            }
            report.warnings.extend(decoded);
        }

        store.set_published_watermark(store.generation()).await?;

        if let Some(first) = report.applied.touched_months.first().copied() {
            self.set_state(ReconcileState::RollingOver);
            report.rollover = self.ledger.refresh_rollover(first.pred()).await?;
        }
        info!(
            cleared = report.cleared,
            inserted = report.applied.inserted,
            warnings = report.warnings.len(),
            "Remote state pulled over local"
        );
        Ok(report)
    }

    /// Live record counts per collection on both sides. Writes nothing.
    #[instrument(skip(self))]
    pub async fn compare(&self) -> Result<CompareReport, ReconcileError> {
        let _timer = LatencyTimer::new("compare");
        let result = self.run_compare().await;
        self.finish("compare", &result);
        result
    }

    async fn run_compare(&self) -> Result<CompareReport, ReconcileError> {
        self.set_state(ReconcileState::Fetching);
        let raw = self.remote.fetch_snapshot().await?;
        let local = LocalRows::load(&*self.ledger.store).await?.live_counts();

        let mut report = CompareReport::default();
        for (collection, local) in Collection::ALL.into_iter().zip(local) {
            let counts = CollectionCounts {
                local,
                remote: raw.live_count(collection),
            };
            metrics::set_live_records("local", collection, counts.local);
            metrics::set_live_records("remote", collection, counts.remote);
            report.collections.insert(collection, counts);
        }
        Ok(report)
    }

    /// Apply merged collections in reference order.
    async fn apply_all(
        &self,
        categories: &CollectionMap<Category>,
        instruments: &CollectionMap<Instrument>,
        ledger: &CollectionMap<LedgerDoc>,
        recurring: &CollectionMap<RecurringDoc>,
    ) -> Result<ApplyReport, StoreError> {
        let store = &*self.ledger.store;
        let apply = ApplyCollection::new(store, &self.ledger.config.default_category_name);

        let mut report = apply.apply::<Category>(categories, &NoRefs).await?;
        report.absorb(apply.apply::<Instrument>(instruments, &NoRefs).await?);

        let refs = InstrumentIndex::load(store).await?;
        report.absorb(apply.apply::<LedgerEntry>(ledger, &refs).await?);
        report.absorb(apply.apply::<RecurringSchedule>(recurring, &refs).await?);
        Ok(report)
    }
}

/// Merge one collection and write the result into the outgoing snapshot.
///
/// Remote records that failed to decode are carried over verbatim unless a
/// local record with the same GlobalID replaces them.
fn merge_collection<P: Payload>(
    rows: &[Record<P>],
    plan: &CollectionPlan,
    refs: &dyn InstrumentRefs,
    remote: Decoded<P::Doc>,
    outgoing: &mut RawSnapshot,
    report: &mut SyncReport,
) -> Result<CollectionMap<P::Doc>, TransportError> {
    let local = plan.export(rows, refs);
    let (merged, stats) = merge_counted(&remote.records, &local);

    encode_collection(outgoing, P::COLLECTION, &merged)?;
    for (gid, value) in remote.rejected {
        if !merged.contains_key(&gid) {
            outgoing.insert(P::COLLECTION, gid, value);
        }
    }

    metrics::record_data_shape_warnings(P::COLLECTION, remote.warnings.len());
    debug!(
        collection = %P::COLLECTION,
        records = merged.len(),
        local_only = stats.local_only,
        remote_deletes = stats.remote_deletes,
        local_deletes = stats.local_deletes,
        local_overrides = stats.local_overrides,
        "Merged collection"
    );
    report.merge.insert(P::COLLECTION, stats);
    report.warnings.extend(remote.warnings);
    Ok(merged)
}

fn push_collection<D: serde::Serialize>(
    outgoing: &mut RawSnapshot,
    report: &mut PushReport,
    collection: Collection,
    records: &CollectionMap<D>,
) -> Result<(), TransportError> {
    encode_collection(outgoing, collection, records)?;
    report.pushed.insert(collection, records.len());
    Ok(())
}
