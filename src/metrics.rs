// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for ledger-sync.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host
//! application picks the exporter.
//!
//! # Metric Naming Convention
//! - `ledger_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: sync, push, pull, compare, check_connection
//! - `status`: success, transport_error, store_error
//! - `collection`: categories, instruments, ledger, recurring
//! - `action`: inserted, updated, tombstoned, reconciled, unchanged, protected

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::record::Collection;

/// Record the outcome of one orchestrator operation.
pub fn record_operation(operation: &'static str, status: &'static str) {
    counter!(
        "ledger_sync_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

pub fn record_latency(operation: &'static str, duration: Duration) {
    histogram!(
        "ledger_sync_operation_seconds",
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// Records written (or skipped) while applying a merged collection.
pub fn record_applied(collection: Collection, action: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "ledger_sync_apply_records_total",
        "collection" => collection.as_str(),
        "action" => action
    )
    .increment(count as u64);
}

pub fn record_data_shape_warnings(collection: Collection, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "ledger_sync_data_shape_warnings_total",
        "collection" => collection.as_str()
    )
    .increment(count as u64);
}

/// Balance-forward writes made by one rollover run.
pub fn record_rollover(months_scanned: usize, writes: usize) {
    histogram!("ledger_sync_rollover_months_scanned").record(months_scanned as f64);
    counter!("ledger_sync_rollover_writes_total").increment(writes as u64);
}

pub fn record_purge(removed: usize) {
    counter!("ledger_sync_purged_rows_total").increment(removed as u64);
}

/// Live record count per side after a compare.
pub fn set_live_records(side: &'static str, collection: Collection, count: usize) {
    gauge!(
        "ledger_sync_live_records",
        "side" => side,
        "collection" => collection.as_str()
    )
    .set(count as f64);
}

/// Track orchestrator state transitions
pub fn set_reconcile_state(state: &'static str) {
    counter!(
        "ledger_sync_state_transitions_total",
        "state" => state
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
