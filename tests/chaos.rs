//! Chaos testing for ledger-sync.
//!
//! Failing wrappers inject errors at precise points of a reconciliation:
//! 1. **FailingRemote** - fetch or put fails (unreachable, bad credentials)
//! 2. **FailingLocalStore** - local inserts fail mid-apply
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;

use ledger_sync::record::{LedgerDoc, Payload, SnapshotRecord};
use ledger_sync::remote::RawSnapshot;
use ledger_sync::store::{ChangeFeed, PurgeStats};
use ledger_sync::{
    Collection, EntryKind, FixedClock, GlobalId, Ledger, LedgerEntry, LedgerSyncConfig, LocalId,
    LocalStore, MemoryLocalStore, MemoryRemote, ReconcileError, ReconcileState, Reconciler,
    Record, RemoteStore, StoreError, TransportError,
};

// =============================================================================
// Failing wrappers - precise error injection
// =============================================================================

/// A remote whose fetch and put can be switched to fail.
pub struct FailingRemote {
    inner: MemoryRemote,
    fail_fetch: AtomicBool,
    fail_put: AtomicBool,
}

impl FailingRemote {
    pub fn new(inner: MemoryRemote) -> Self {
        Self {
            inner,
            fail_fetch: AtomicBool::new(false),
            fail_put: AtomicBool::new(false),
        }
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for FailingRemote {
    async fn fetch_snapshot(&self) -> Result<RawSnapshot, TransportError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        self.inner.fetch_snapshot().await
    }

    async fn put_snapshot(&self, snapshot: RawSnapshot) -> Result<(), TransportError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 401,
                body: "Permission denied".into(),
            });
        }
        self.inner.put_snapshot(snapshot).await
    }
}

/// A local store whose inserts can be switched to fail.
pub struct FailingLocalStore {
    inner: MemoryLocalStore,
    fail_inserts: AtomicBool,
}

impl FailingLocalStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryLocalStore::new(),
            fail_inserts: AtomicBool::new(false),
        }
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalStore for FailingLocalStore {
    async fn fetch_all<P: Payload>(&self) -> Result<Vec<Record<P>>, StoreError> {
        self.inner.fetch_all().await
    }

    async fn fetch<P: Payload>(&self, id: LocalId) -> Result<Option<Record<P>>, StoreError> {
        self.inner.fetch(id).await
    }

    async fn fetch_by_global_id<P: Payload>(
        &self,
        global_id: &GlobalId,
    ) -> Result<Option<Record<P>>, StoreError> {
        self.inner.fetch_by_global_id(global_id).await
    }

    async fn insert<P: Payload>(
        &self,
        global_id: Option<GlobalId>,
        payload: P,
    ) -> Result<LocalId, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk I/O error".into()));
        }
        self.inner.insert(global_id, payload).await
    }

    async fn update_fields<P: Payload>(&self, id: LocalId, payload: P) -> Result<(), StoreError> {
        self.inner.update_fields(id, payload).await
    }

    async fn set_deleted<P: Payload>(&self, id: LocalId, deleted: bool) -> Result<(), StoreError> {
        self.inner.set_deleted::<P>(id, deleted).await
    }

    async fn assign_global_id<P: Payload>(
        &self,
        id: LocalId,
        global_id: GlobalId,
    ) -> Result<(), StoreError> {
        self.inner.assign_global_id::<P>(id, global_id).await
    }

    async fn clear<P: Payload>(&self) -> Result<usize, StoreError> {
        self.inner.clear::<P>().await
    }

    async fn purge(&self, up_to_revision: Option<u64>) -> Result<PurgeStats, StoreError> {
        self.inner.purge(up_to_revision).await
    }

    fn generation(&self) -> u64 {
        self.inner.generation()
    }

    async fn published_watermark(&self) -> Result<u64, StoreError> {
        self.inner.published_watermark().await
    }

    async fn set_published_watermark(&self, generation: u64) -> Result<(), StoreError> {
        self.inner.set_published_watermark(generation).await
    }

    fn change_feed(&self) -> &ChangeFeed {
        self.inner.change_feed()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()))
}

fn entry(kind: EntryKind, amount: &str, month: u32) -> LedgerEntry {
    LedgerEntry {
        kind,
        description: "chaos".into(),
        amount: amount.parse().unwrap(),
        category: "Other".into(),
        timestamp: NaiveDate::from_ymd_opt(2024, month, 4)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap(),
        instrument: None,
    }
}

fn remote_entry(kind: EntryKind, amount: &str, month: u32) -> serde_json::Value {
    let doc: LedgerDoc = LedgerEntry {
        kind,
        description: "from elsewhere".into(),
        amount: amount.parse().unwrap(),
        category: "Other".into(),
        timestamp: NaiveDate::from_ymd_opt(2024, month, 9)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap(),
        instrument: None,
    };
    serde_json::to_value(SnapshotRecord::live(doc)).unwrap()
}

async fn local_state<L: LocalStore>(store: &L) -> Vec<Record<LedgerEntry>> {
    store.fetch_all::<LedgerEntry>().await.unwrap()
}

// =============================================================================
// Transport failures
// =============================================================================

#[tokio::test]
async fn chaos_unreachable_remote_leaves_local_untouched() {
    let remote = Arc::new(FailingRemote::new(MemoryRemote::new()));
    let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default())
        .with_clock(clock());
    ledger.add_entry(entry(EntryKind::Income, "500", 1)).await.unwrap();
    let reconciler = Reconciler::new(ledger.clone(), Arc::clone(&remote));

    let before = local_state(&**ledger.store()).await;
    let generation = ledger.store().generation();

    remote.fail_fetch(true);
    let err = reconciler.sync().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Transport(TransportError::Unreachable(_))));
    assert_eq!(reconciler.state(), ReconcileState::Failed);
    assert_eq!(local_state(&**ledger.store()).await, before);
    assert_eq!(ledger.store().generation(), generation);

    assert!(reconciler.check_connection().await.is_err());
    assert!(reconciler.compare().await.is_err());
}

#[tokio::test]
async fn chaos_rejected_push_leaves_local_untouched() {
    let remote = Arc::new(FailingRemote::new(MemoryRemote::with_document(json!({
        "transactions": { "r1": remote_entry(EntryKind::Income, "40", 2) }
    }))));
    let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default())
        .with_clock(clock());
    ledger.ensure_default_categories().await.unwrap();
    ledger.add_entry(entry(EntryKind::Income, "500", 1)).await.unwrap();
    let reconciler = Reconciler::new(ledger.clone(), Arc::clone(&remote));

    let before = local_state(&**ledger.store()).await;
    let generation = ledger.store().generation();

    remote.fail_put(true);
    let err = reconciler.sync().await.unwrap_err();
    assert_eq!(err.to_string(), "remote returned HTTP 401: Permission denied");

    // No ids minted, nothing applied.
    assert_eq!(local_state(&**ledger.store()).await, before);
    assert_eq!(ledger.store().generation(), generation);
    assert!(ledger
        .categories(None)
        .await
        .unwrap()
        .iter()
        .all(|r| r.global_id.is_none()));

    let err = reconciler.force_push().await.unwrap_err();
    assert_eq!(err.status(), "transport_error");
    assert_eq!(ledger.store().generation(), generation);

    remote.fail_put(false);
    let report = reconciler.sync().await.unwrap();
    assert_eq!(report.applied.inserted, 1);
    assert!(reconciler.compare().await.unwrap().is_balanced());
}

#[tokio::test]
async fn chaos_failed_pull_keeps_local_rows() {
    let remote = Arc::new(FailingRemote::new(MemoryRemote::new()));
    let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default())
        .with_clock(clock());
    ledger.add_entry(entry(EntryKind::Expense, "12", 3)).await.unwrap();
    let reconciler = Reconciler::new(ledger.clone(), Arc::clone(&remote));

    remote.fail_fetch(true);
    assert!(reconciler.force_pull().await.is_err());
    let march = ledger_sync::YearMonth::new(2024, 3).unwrap();
    assert_eq!(ledger.entries_in_month(march).await.unwrap().len(), 1);
}

// =============================================================================
// Local failures
// =============================================================================

#[tokio::test]
async fn chaos_failed_apply_recovers_on_next_sync() {
    let remote = Arc::new(MemoryRemote::with_document(json!({
        "transactions": { "a-1": remote_entry(EntryKind::Income, "1000", 1) }
    })));
    let store = Arc::new(FailingLocalStore::new());
    let ledger = Ledger::new(Arc::clone(&store), LedgerSyncConfig::default()).with_clock(clock());
    ledger.add_entry(entry(EntryKind::Expense, "100", 3)).await.unwrap();
    let reconciler = Reconciler::new(ledger.clone(), Arc::clone(&remote));

    store.fail_inserts(true);
    let err = reconciler.sync().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Backend(_))));
    assert_eq!(reconciler.state(), ReconcileState::Failed);

    store.fail_inserts(false);
    let report = reconciler.sync().await.unwrap();
    assert_eq!(report.applied.inserted, 1);
    // Feb, Mar and Apr carry the January income forward.
    assert_eq!(report.rollover.inserted, 3);

    // The new balance-forward entries are published by the next sync.
    let report = reconciler.sync().await.unwrap();
    assert_eq!(report.identities_assigned, 3);
    let compare = reconciler.compare().await.unwrap();
    assert!(compare.is_balanced(), "{compare}");
    assert_eq!(compare.get(Collection::Ledger).remote, 5);
}

#[tokio::test]
async fn chaos_remote_garbage_is_never_fatal() {
    let remote = Arc::new(MemoryRemote::with_document(json!({
        "categories": [null, {"name": 42}, {"name": "Food", "kind": "expense"}],
        "cards": {"c1": "not an object"},
        "transactions": {"t1": {"is_deleted": 7}},
        "recurring": null,
        "last_update": "yesterday"
    })));
    let ledger = Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default())
        .with_clock(clock());
    let reconciler = Reconciler::new(ledger.clone(), Arc::clone(&remote));

    let report = reconciler.sync().await.unwrap();
    assert_eq!(report.warnings.len(), 3);
    assert_eq!(report.applied.inserted, 1);

    let document = remote.document();
    assert_eq!(document["categories"]["1"], json!({"name": 42}));
    assert_eq!(document["cards"]["c1"], json!("not an object"));
    assert_eq!(document["transactions"]["t1"], json!({"is_deleted": 7}));
}
