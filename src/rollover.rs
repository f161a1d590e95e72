// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Monthly balance-forward cascade.
//!
//! A month's cash balance is income minus expense and repayment, counting
//! only cash-equivalent flows (no card attached, or a repayment toward one).
//! A Balance-Forward entry dated in month M counts as income of M, so positive
//! balances compound until spent.
//!
//! [`RolloverEngine::recalculate_from`] walks forward one month at a time.
//! For each step M to M+1 it finds every Balance-Forward entry dated in M+1,
//! tombstoned or not, keeps one and tombstones any other live duplicates.
//! If `balance(M) > 0` the kept entry carries that amount and is live; a new
//! entry dated the first of M+1 is inserted when none can be kept. Otherwise
//! the kept entry is tombstoned.
//!
//! The kept entry is the lowest-LocalID live one. With none live, a
//! tombstone may be revived only if it was never published to the remote
//! (no GlobalID, or a revision above the published watermark): a published
//! tombstone would win the next merge and the revival would be undone.
//!
//! The walk is a bounded loop. It stops when M+1 passes the current month
//! plus the configured lookahead, or after the configured number of steps.
//! Re-running with nothing changed writes nothing.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::config::LedgerSyncConfig;
use crate::metrics;
use crate::month::{Clock, YearMonth};
use crate::record::{EntryKind, LedgerEntry, Record};
use crate::store::{LocalStore, StoreError};

/// What counts as a Balance-Forward entry and how far the cascade runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverPolicy {
    pub label: String,
    pub legacy_labels: Vec<String>,
    pub category: String,
    pub max_months: u32,
    pub lookahead_months: u32,
}

impl RolloverPolicy {
    #[must_use]
    pub fn is_balance_forward(&self, entry: &LedgerEntry) -> bool {
        self.is_reserved_label(&entry.description)
    }

    /// Descriptions user entries may not carry.
    #[must_use]
    pub fn is_reserved_label(&self, description: &str) -> bool {
        description == self.label || self.legacy_labels.iter().any(|l| l == description)
    }

    fn entry_for(&self, month: YearMonth, amount: Decimal) -> LedgerEntry {
        LedgerEntry {
            kind: EntryKind::Income,
            description: self.label.clone(),
            amount,
            category: self.category.clone(),
            timestamp: month.first_instant(),
            instrument: None,
        }
    }
}

impl From<&LedgerSyncConfig> for RolloverPolicy {
    fn from(config: &LedgerSyncConfig) -> Self {
        Self {
            label: config.balance_forward_label.clone(),
            legacy_labels: config.legacy_balance_forward_labels.clone(),
            category: config.balance_forward_category.clone(),
            max_months: config.rollover_max_months,
            lookahead_months: config.rollover_lookahead_months,
        }
    }
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self::from(&LedgerSyncConfig::default())
    }
}

/// Income, outgoings and net cash balance of one month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonthSummary {
    pub income: Decimal,
    /// Expenses plus repayments
    pub expense: Decimal,
    pub balance: Decimal,
}

impl MonthSummary {
    /// Aggregate the live, cash-equivalent entries among `entries`.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Record<LedgerEntry>>) -> Self {
        let mut summary = Self::default();
        for record in entries {
            if record.is_deleted || !record.payload.is_cash_equivalent() {
                continue;
            }
            match record.payload.kind {
                EntryKind::Income => summary.income += record.payload.amount,
                EntryKind::Expense | EntryKind::Repayment => summary.expense += record.payload.amount,
            }
        }
        summary.balance = summary.income - summary.expense;
        summary
    }
}

/// Writes made by one cascade run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloverReport {
    pub months_scanned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub revived: usize,
    pub tombstoned: usize,
    /// Extra live entries in one month tombstoned by de-duplication
    pub deduplicated: usize,
}

impl RolloverReport {
    #[must_use]
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.revived + self.tombstoned + self.deduplicated
    }
}

pub struct RolloverEngine<'a, L> {
    store: &'a L,
    policy: &'a RolloverPolicy,
    clock: &'a dyn Clock,
}

impl<'a, L: LocalStore> RolloverEngine<'a, L> {
    pub fn new(store: &'a L, policy: &'a RolloverPolicy, clock: &'a dyn Clock) -> Self {
        Self { store, policy, clock }
    }

    /// Recompute every Balance-Forward entry after `start`.
    ///
    /// Change notifications are held until the run finishes and published
    /// as one event, only if something was written.
    #[instrument(skip_all, fields(start = %start))]
    pub async fn recalculate_from(&self, start: YearMonth) -> Result<RolloverReport, StoreError> {
        let entries = self.store.fetch_all::<LedgerEntry>().await?;
        let watermark = self.store.published_watermark().await?;
        let horizon = self
            .clock
            .current_month()
            .add_months(self.policy.lookahead_months as i32);

        // Sums of ordinary entries never change during the walk; forwards do.
        let mut ordinary: HashMap<YearMonth, Decimal> = HashMap::new();
        let mut forwards: BTreeMap<YearMonth, Vec<Record<LedgerEntry>>> = BTreeMap::new();
        for record in entries {
            let month = record.payload.month();
            if self.policy.is_balance_forward(&record.payload) {
                forwards.entry(month).or_default().push(record);
            } else if record.is_live() {
                if let Some(delta) = record.payload.cash_delta() {
                    *ordinary.entry(month).or_default() += delta;
                }
            }
        }
        for group in forwards.values_mut() {
            group.sort_by_key(|r| r.local_id);
        }

        let _quiet = self.store.change_feed().suppress();
        let mut report = RolloverReport::default();
        let mut month = start;
        while report.months_scanned < self.policy.max_months as usize {
            let next = month.succ();
            if next > horizon {
                break;
            }
            report.months_scanned += 1;

            let balance = ordinary.get(&month).copied().unwrap_or_default()
                + forwards
                    .get(&month)
                    .into_iter()
                    .flatten()
                    .filter(|r| r.is_live())
                    .filter_map(|r| r.payload.cash_delta())
                    .sum::<Decimal>();

            let group = forwards.entry(next).or_default();
            self.settle_month(next, balance, group, watermark, &mut report)
                .await?;
            month = next;
        }

        metrics::record_rollover(report.months_scanned, report.writes());
        if report.writes() > 0 {
            debug!(
                months = report.months_scanned,
                inserted = report.inserted,
                updated = report.updated,
                revived = report.revived,
                tombstoned = report.tombstoned,
                deduplicated = report.deduplicated,
                "Balance-forward cascade wrote changes"
            );
        }
        Ok(report)
    }

    /// Bring the Balance-Forward entries of `month` in line with `balance`,
    /// updating `group` to the written state.
    async fn settle_month(
        &self,
        month: YearMonth,
        balance: Decimal,
        group: &mut Vec<Record<LedgerEntry>>,
        watermark: u64,
        report: &mut RolloverReport,
    ) -> Result<(), StoreError> {
        let keep = group
            .iter()
            .position(|r| r.is_live())
            .or_else(|| {
                group.iter().position(|r| {
                    r.global_id.is_none() || r.revision > watermark
                })
            });

        for (i, record) in group.iter_mut().enumerate() {
            if Some(i) != keep && record.is_live() {
                self.store.mark_deleted::<LedgerEntry>(record.local_id).await?;
                record.is_deleted = true;
                report.deduplicated += 1;
            }
        }

        if balance > Decimal::ZERO {
            match keep {
                Some(i) => {
                    let record = &mut group[i];
                    if record.payload.amount != balance {
                        record.payload.amount = balance;
                        self.store
                            .update_fields(record.local_id, record.payload.clone())
                            .await?;
                        report.updated += 1;
                    }
                    if record.is_deleted {
                        self.store
                            .set_deleted::<LedgerEntry>(record.local_id, false)
                            .await?;
                        record.is_deleted = false;
                        report.revived += 1;
                    }
                }
                None => {
                    let entry = self.policy.entry_for(month, balance);
                    let local_id = self.store.insert(None, entry.clone()).await?;
                    group.push(Record {
                        local_id,
                        global_id: None,
                        is_deleted: false,
                        revision: self.store.generation(),
                        payload: entry,
                    });
                    report.inserted += 1;
                }
            }
        } else if let Some(i) = keep {
            let record = &mut group[i];
            if record.is_live() {
                self.store.mark_deleted::<LedgerEntry>(record.local_id).await?;
                record.is_deleted = true;
                report.tombstoned += 1;
            }
        }
        Ok(())
    }
}
