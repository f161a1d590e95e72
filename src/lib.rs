// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Ledger Sync
//!
//! Local/remote reconciliation for a personal finance ledger.
//!
//! ## Architecture
//!
//! A device keeps its ledger in an embedded local store and periodically
//! reconciles it against one shared remote snapshot document:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Ledger                              │
//! │  • User-facing writes (entries, categories, cards, ...)    │
//! │  • Refreshes the balance-forward cascade after each edit   │
//! └─────────────────────────────────────────────────────────────┘
//!                  │        single-writer lock        │
//!                  ▼                                  ▼
//! ┌───────────────────────────┐      ┌──────────────────────────┐
//! │        LocalStore         │◄─────│        Reconciler        │
//! │  • Memory or SQLite       │apply │  • fetch → merge → push  │
//! │  • LocalID + GlobalID     │      │  • apply → cascade       │
//! │  • Tombstones, purge      │      │  • purge                 │
//! └───────────────────────────┘      └──────────────────────────┘
//!                                                  │
//!                                    (whole-document read/write)
//!                                                  ▼
//!                                    ┌──────────────────────────┐
//!                                    │       RemoteStore        │
//!                                    │  • One JSON snapshot     │
//!                                    └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledger_sync::{Ledger, LedgerSyncConfig, MemoryRemote, Reconciler, SqliteLocalStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LedgerSyncConfig {
//!         local_url: Some("sqlite://ledger.db".into()),
//!         ..Default::default()
//!     };
//!     let store = Arc::new(SqliteLocalStore::from_config(&config).await?);
//!     let ledger = Ledger::new(store, config);
//!     ledger.ensure_default_categories().await?;
//!
//!     let reconciler = Reconciler::new(ledger.clone(), Arc::new(MemoryRemote::new()));
//!     let report = reconciler.sync().await?;
//!     println!("{} local writes", report.applied.writes());
//!     Ok(())
//! }
//! ```
//!
//! ## Merge rules
//!
//! Per collection, keyed by GlobalID: a record only one side has is kept; a
//! tombstone on either side wins; otherwise the local record wins.
//!
//! ## Modules
//!
//! - [`ledger`]: user-facing write paths
//! - [`reconcile`]: the [`Reconciler`] and its control surface
//! - [`merge`]: the pure merge function
//! - [`apply`]: writing merged collections back, with identity reconciliation
//! - [`rollover`]: the monthly balance-forward cascade
//! - [`store`]: local stores (memory, SQLite) and change notifications
//! - [`remote`]: remote stores and the snapshot document codec
//! - [`resilience`]: retry for local database access

pub mod apply;
pub mod config;
pub mod ledger;
pub mod merge;
pub mod metrics;
pub mod month;
pub mod record;
pub mod reconcile;
pub mod remote;
pub mod resilience;
pub mod rollover;
pub mod store;

pub use apply::{ApplyCollection, ApplyReport, InstrumentIndex};
pub use config::LedgerSyncConfig;
pub use ledger::{Ledger, LedgerError};
pub use merge::{merge, MergeStats};
pub use month::{Clock, FixedClock, SystemClock, YearMonth};
pub use record::{
    Category, CategoryKind, Collection, EntryKind, GlobalId, Instrument, LedgerEntry, LocalId,
    Record, RecurringSchedule,
};
pub use reconcile::{
    Command, CommandOutcome, CompareReport, ReconcileError, ReconcileState, Reconciler, SyncReport,
};
pub use remote::{DataShapeError, MemoryRemote, RawSnapshot, RemoteStore, TransportError};
pub use resilience::retry::RetryConfig;
pub use rollover::{MonthSummary, RolloverEngine, RolloverPolicy, RolloverReport};
pub use store::{ChangeEvent, LocalStore, MemoryLocalStore, SqliteLocalStore, StoreError};
pub use metrics::LatencyTimer;
