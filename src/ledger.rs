// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! User-facing write paths.
//!
//! Every write holds the single-writer lock shared with the
//! [`Reconciler`](crate::reconcile::Reconciler), so a user edit can never land
//! between a sync's read and its apply. Ledger-entry writes refresh the
//! balance-forward cascade from the month before the touched month before
//! returning.
//!
//! Balance-Forward entries are system-owned: they cannot be created, edited
//! or deleted here. The default category of each kind cannot be deleted or
//! renamed.
//!
//! New ledger entries and recurring schedules get a GlobalID at creation.
//! Categories and instruments get theirs on first sync, so that a record
//! created offline can join a same-named remote record instead of
//! duplicating it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument};

use crate::config::LedgerSyncConfig;
use crate::month::{Clock, SystemClock, YearMonth};
use crate::record::{
    Category, CategoryKind, Collection, GlobalId, Instrument, LedgerEntry, LocalId, Payload, Record,
    RecurringSchedule,
};
use crate::rollover::{MonthSummary, RolloverEngine, RolloverPolicy, RolloverReport};
use crate::store::{ChangeEvent, LocalStore, StoreError};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{collection} record {id} not found")]
    NotFound { collection: Collection, id: LocalId },
    #[error("ledger entry {0} is a system-owned balance-forward entry")]
    SystemOwned(LocalId),
    #[error("category '{0}' is the protected default category")]
    ProtectedCategory(String),
    #[error("description '{0}' is reserved for balance-forward entries")]
    ReservedDescription(String),
}

pub struct Ledger<L> {
    pub(crate) store: Arc<L>,
    pub(crate) writer: Arc<Mutex<()>>,
    pub(crate) config: Arc<LedgerSyncConfig>,
    pub(crate) policy: Arc<RolloverPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<L> Clone for Ledger<L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            writer: Arc::clone(&self.writer),
            config: Arc::clone(&self.config),
            policy: Arc::clone(&self.policy),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<L: LocalStore> Ledger<L> {
    pub fn new(store: Arc<L>, config: LedgerSyncConfig) -> Self {
        let policy = RolloverPolicy::from(&config);
        Self {
            store,
            writer: Arc::new(Mutex::new(())),
            config: Arc::new(config),
            policy: Arc::new(policy),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock (tests, replays).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<L> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &LedgerSyncConfig {
        &self.config
    }

    /// Change notifications from the underlying store.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.change_feed().subscribe()
    }

    // ----- categories -----

    /// Seed the default category set into an empty store, and make sure the
    /// protected default category of each kind exists and is live.
    ///
    /// Returns the number of rows written.
    pub async fn ensure_default_categories(&self) -> Result<usize, LedgerError> {
        let _writer = self.writer.lock().await;
        Ok(self.ensure_default_categories_locked().await?)
    }

    pub(crate) async fn ensure_default_categories_locked(&self) -> Result<usize, StoreError> {
        let rows = self.store.fetch_all::<Category>().await?;
        let mut written = 0;

        if rows.is_empty() && self.config.seed_default_categories {
            let _quiet = self.store.change_feed().suppress();
            for category in default_categories(&self.config.default_category_name) {
                self.store.insert(None, category).await?;
                written += 1;
            }
            info!(written, "Seeded default categories");
            return Ok(written);
        }

        for kind in [CategoryKind::Expense, CategoryKind::Income] {
            let mut same: Vec<&Record<Category>> = rows
                .iter()
                .filter(|r| r.payload.kind == kind && r.payload.name == self.config.default_category_name)
                .collect();
            if same.iter().any(|r| r.is_live()) {
                continue;
            }
            same.sort_by_key(|r| r.local_id);
            match same.first() {
                Some(tombstoned) => {
                    self.store
                        .set_deleted::<Category>(tombstoned.local_id, false)
                        .await?;
                }
                None => {
                    let category = Category::new(self.config.default_category_name.clone(), kind)
                        .with_keywords(&["other"]);
                    self.store.insert(None, category).await?;
                }
            }
            debug!(kind = kind.as_str(), "Restored protected default category");
            written += 1;
        }
        Ok(written)
    }

    /// Live categories, optionally of one kind.
    pub async fn categories(&self, kind: Option<CategoryKind>) -> Result<Vec<Record<Category>>, LedgerError> {
        Ok(self
            .live::<Category>()
            .await?
            .into_iter()
            .filter(|r| kind.map_or(true, |k| r.payload.kind == k))
            .collect())
    }

    pub async fn add_category(&self, category: Category) -> Result<LocalId, LedgerError> {
        let _writer = self.writer.lock().await;
        Ok(self.store.insert(None, category).await?)
    }

    pub async fn update_category(&self, id: LocalId, category: Category) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        let current = self.live_row::<Category>(id).await?;
        // Name and kind together are the natural key; keywords may change.
        if self.is_protected(&current.payload)
            && current.payload.natural_key() != category.natural_key()
        {
            return Err(LedgerError::ProtectedCategory(current.payload.name));
        }
        self.store.update_fields(id, category).await?;
        Ok(())
    }

    pub async fn delete_category(&self, id: LocalId) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        let current = self.live_row::<Category>(id).await?;
        if self.is_protected(&current.payload) {
            return Err(LedgerError::ProtectedCategory(current.payload.name));
        }
        self.store.mark_deleted::<Category>(id).await?;
        Ok(())
    }

    fn is_protected(&self, category: &Category) -> bool {
        category.name == self.config.default_category_name
    }

    // ----- instruments -----

    pub async fn instruments(&self) -> Result<Vec<Record<Instrument>>, LedgerError> {
        self.live::<Instrument>().await
    }

    pub async fn add_instrument(&self, instrument: Instrument) -> Result<LocalId, LedgerError> {
        let _writer = self.writer.lock().await;
        Ok(self.store.insert(None, instrument).await?)
    }

    pub async fn update_instrument(&self, id: LocalId, instrument: Instrument) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        self.live_row::<Instrument>(id).await?;
        self.store.update_fields(id, instrument).await?;
        Ok(())
    }

    /// Tombstone an instrument. Entries and schedules that referenced it
    /// become cash flows, and the cascade is refreshed from the earliest
    /// affected month.
    #[instrument(skip(self))]
    pub async fn delete_instrument(&self, id: LocalId) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        self.live_row::<Instrument>(id).await?;

        let _quiet = self.store.change_feed().suppress();
        let mut earliest: Option<YearMonth> = None;
        for mut row in self.store.fetch_all::<LedgerEntry>().await? {
            if row.payload.instrument != Some(id) {
                continue;
            }
            row.payload.instrument = None;
            let month = row.payload.month();
            earliest = Some(earliest.map_or(month, |m| m.min(month)));
            self.store.update_fields(row.local_id, row.payload).await?;
        }
        for mut row in self.store.fetch_all::<RecurringSchedule>().await? {
            if row.payload.instrument == Some(id) {
                row.payload.instrument = None;
                self.store.update_fields(row.local_id, row.payload).await?;
            }
        }
        self.store.mark_deleted::<Instrument>(id).await?;

        if let Some(month) = earliest {
            self.refresh_rollover(month.pred()).await?;
        }
        Ok(())
    }

    // ----- ledger entries -----

    pub async fn add_entry(&self, entry: LedgerEntry) -> Result<LocalId, LedgerError> {
        self.reject_reserved(&entry.description)?;
        let _writer = self.writer.lock().await;
        let month = entry.month();
        let id = self.store.insert(Some(GlobalId::generate()), entry).await?;
        self.refresh_rollover(month.pred()).await?;
        Ok(id)
    }

    pub async fn update_entry(&self, id: LocalId, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.reject_reserved(&entry.description)?;
        let _writer = self.writer.lock().await;
        let current = self.user_entry(id).await?;
        let start = current.payload.month().min(entry.month());
        self.store.update_fields(id, entry).await?;
        self.refresh_rollover(start.pred()).await?;
        Ok(())
    }

    pub async fn delete_entry(&self, id: LocalId) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        let current = self.user_entry(id).await?;
        self.store.mark_deleted::<LedgerEntry>(id).await?;
        self.refresh_rollover(current.payload.month().pred()).await?;
        Ok(())
    }

    /// Live entries of `month`, newest first. Refreshes the carry-over into
    /// `month` first.
    pub async fn entries_in_month(&self, month: YearMonth) -> Result<Vec<Record<LedgerEntry>>, LedgerError> {
        {
            let _writer = self.writer.lock().await;
            self.refresh_rollover(month.pred()).await?;
        }
        let mut rows: Vec<Record<LedgerEntry>> = self
            .live::<LedgerEntry>()
            .await?
            .into_iter()
            .filter(|r| r.payload.month() == month)
            .collect();
        rows.sort_by(|a, b| b.payload.timestamp.cmp(&a.payload.timestamp));
        Ok(rows)
    }

    pub async fn month_summary(&self, month: YearMonth) -> Result<MonthSummary, LedgerError> {
        let entries = self.entries_in_month(month).await?;
        Ok(MonthSummary::from_entries(&entries))
    }

    #[must_use]
    pub fn is_balance_forward(&self, entry: &LedgerEntry) -> bool {
        self.policy.is_balance_forward(entry)
    }

    fn reject_reserved(&self, description: &str) -> Result<(), LedgerError> {
        if self.policy.is_reserved_label(description) {
            return Err(LedgerError::ReservedDescription(description.to_string()));
        }
        Ok(())
    }

    async fn user_entry(&self, id: LocalId) -> Result<Record<LedgerEntry>, LedgerError> {
        let row = self.live_row::<LedgerEntry>(id).await?;
        if self.policy.is_balance_forward(&row.payload) {
            return Err(LedgerError::SystemOwned(id));
        }
        Ok(row)
    }

    // ----- recurring schedules -----

    /// Live schedules ordered by day of month.
    pub async fn recurring(&self) -> Result<Vec<Record<RecurringSchedule>>, LedgerError> {
        let mut rows = self.live::<RecurringSchedule>().await?;
        rows.sort_by_key(|r| (r.payload.day_of_month, r.local_id));
        Ok(rows)
    }

    pub async fn add_recurring(&self, schedule: RecurringSchedule) -> Result<LocalId, LedgerError> {
        let _writer = self.writer.lock().await;
        Ok(self.store.insert(Some(GlobalId::generate()), schedule).await?)
    }

    pub async fn update_recurring(&self, id: LocalId, schedule: RecurringSchedule) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        self.live_row::<RecurringSchedule>(id).await?;
        self.store.update_fields(id, schedule).await?;
        Ok(())
    }

    pub async fn delete_recurring(&self, id: LocalId) -> Result<(), LedgerError> {
        let _writer = self.writer.lock().await;
        self.live_row::<RecurringSchedule>(id).await?;
        self.store.mark_deleted::<RecurringSchedule>(id).await?;
        Ok(())
    }

    // ----- shared -----

    async fn live<P: Payload>(&self) -> Result<Vec<Record<P>>, LedgerError> {
        Ok(self
            .store
            .fetch_all::<P>()
            .await?
            .into_iter()
            .filter(Record::is_live)
            .collect())
    }

    async fn live_row<P: Payload>(&self, id: LocalId) -> Result<Record<P>, LedgerError> {
        match self.store.fetch::<P>(id).await? {
            Some(row) if row.is_live() => Ok(row),
            _ => Err(LedgerError::NotFound {
                collection: P::COLLECTION,
                id,
            }),
        }
    }

    /// Run the cascade. The caller holds the writer lock.
    pub(crate) async fn refresh_rollover(&self, start: YearMonth) -> Result<RolloverReport, StoreError> {
        RolloverEngine::new(&*self.store, &self.policy, &*self.clock)
            .recalculate_from(start)
            .await
    }
}

fn default_categories(other: &str) -> Vec<Category> {
    vec![
        Category::new("Food", CategoryKind::Expense).with_keywords(&["rice", "noodles"]),
        Category::new("Transport", CategoryKind::Expense).with_keywords(&["bus", "bts"]),
        Category::new("Salary", CategoryKind::Income).with_keywords(&["salary"]),
        Category::new("Shopping", CategoryKind::Expense).with_keywords(&["shop"]),
        Category::new(other, CategoryKind::Expense).with_keywords(&["other"]),
        Category::new(other, CategoryKind::Income).with_keywords(&["other"]),
    ]
}
