// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record model shared by the local store, the remote snapshot and the engines.
//!
//! Every persisted row is a [`Record`]: a store-local [`LocalId`], an optional
//! [`GlobalId`] (the merge key across devices), a tombstone bit, the store
//! revision of its last write, and a typed payload. The four payload shapes
//! implement [`Payload`], which also describes their wire document: ledger
//! entries and recurring schedules reference instruments by `LocalId` locally
//! and by `GlobalId` on the wire.
//!
//! # Example
//!
//! ```
//! use ledger_sync::record::{Category, CategoryKind, Payload};
//!
//! let food = Category::new("Food", CategoryKind::Expense);
//! assert_eq!(food.natural_key().as_deref(), Some("expense/Food"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

use crate::month::YearMonth;

/// Store-local sequence id. Stable for the life of the row and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Globally unique merge key. Assigned once, never changed by user edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(String);

impl GlobalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GlobalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The four synchronized collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Categories,
    Instruments,
    Ledger,
    Recurring,
}

impl Collection {
    /// Apply order: referenced collections before the ones that reference them.
    pub const ALL: [Collection; 4] = [
        Collection::Categories,
        Collection::Instruments,
        Collection::Ledger,
        Collection::Recurring,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Instruments => "instruments",
            Self::Ledger => "ledger",
            Self::Recurring => "recurring",
        }
    }

    /// Backing table name in the SQLite store.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Instruments => "instruments",
            Self::Ledger => "ledger_entries",
            Self::Recurring => "recurring_schedules",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Income,
    Expense,
    Repayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Income,
    Expense,
}

impl CategoryKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }
}

/// A single income/expense/repayment line.
///
/// `I` is the instrument reference: [`LocalId`] in the store, [`GlobalId`] on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry<I = LocalId> {
    pub kind: EntryKind,
    pub description: String,
    pub amount: Decimal,
    pub category: String,
    pub timestamp: NaiveDateTime,
    pub instrument: Option<I>,
}

impl<I> LedgerEntry<I> {
    #[must_use]
    pub fn month(&self) -> YearMonth {
        YearMonth::from_date(self.timestamp.date())
    }

    /// Cash flows: no instrument attached, or a repayment toward one.
    #[must_use]
    pub fn is_cash_equivalent(&self) -> bool {
        self.instrument.is_none() || self.kind == EntryKind::Repayment
    }

    /// Contribution to the month's cash balance, `None` for card-only flows.
    #[must_use]
    pub fn cash_delta(&self) -> Option<Decimal> {
        if !self.is_cash_equivalent() {
            return None;
        }
        match self.kind {
            EntryKind::Income => Some(self.amount),
            EntryKind::Expense | EntryKind::Repayment => Some(-self.amount),
        }
    }

    fn with_instrument<J>(&self, instrument: Option<J>) -> LedgerEntry<J> {
        LedgerEntry {
            kind: self.kind,
            description: self.description.clone(),
            amount: self.amount,
            category: self.category.clone(),
            timestamp: self.timestamp,
            instrument,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub kind: CategoryKind,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Category {
    pub fn new(name: impl Into<String>, kind: CategoryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            keywords: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| (*k).to_string()).collect();
        self
    }
}

/// A payment card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub credit_limit: Decimal,
    pub closing_day: u8,
    #[serde(default)]
    pub color_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule<I = LocalId> {
    pub day_of_month: u8,
    pub description: String,
    pub amount: Decimal,
    pub category: String,
    pub instrument: Option<I>,
    #[serde(default)]
    pub auto_pay: bool,
}

impl<I> RecurringSchedule<I> {
    fn with_instrument<J>(&self, instrument: Option<J>) -> RecurringSchedule<J> {
        RecurringSchedule {
            day_of_month: self.day_of_month,
            description: self.description.clone(),
            amount: self.amount,
            category: self.category.clone(),
            instrument,
            auto_pay: self.auto_pay,
        }
    }
}

pub type LedgerDoc = LedgerEntry<GlobalId>;
pub type RecurringDoc = RecurringSchedule<GlobalId>;

/// A persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<P> {
    pub local_id: LocalId,
    pub global_id: Option<GlobalId>,
    pub is_deleted: bool,
    /// Store generation at the last write to this row.
    pub revision: u64,
    pub payload: P,
}

impl<P> Record<P> {
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }

    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> Record<Q> {
        Record {
            local_id: self.local_id,
            global_id: self.global_id,
            is_deleted: self.is_deleted,
            revision: self.revision,
            payload: f(self.payload),
        }
    }
}

/// Translation between local and global instrument references.
pub trait InstrumentRefs: Send + Sync {
    fn export(&self, local: LocalId) -> Option<GlobalId>;
    fn import(&self, global: &GlobalId) -> Option<LocalId>;
}

/// Identity mapping for payloads without references.
pub struct NoRefs;

impl InstrumentRefs for NoRefs {
    fn export(&self, _local: LocalId) -> Option<GlobalId> {
        None
    }

    fn import(&self, _global: &GlobalId) -> Option<LocalId> {
        None
    }
}

/// Result of turning a wire document back into a local payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Imported<P> {
    pub payload: P,
    /// The document referenced an instrument this store does not know.
    pub dangling_ref: bool,
}

/// A payload type stored in one collection.
pub trait Payload:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const COLLECTION: Collection;

    /// Wire form carried in snapshots.
    type Doc: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Key used to reconcile records created before they had a global id.
    fn natural_key(&self) -> Option<String> {
        None
    }

    fn as_category(&self) -> Option<&Category> {
        None
    }

    /// Month a ledger entry counts toward. `None` for other collections.
    fn ledger_month(&self) -> Option<YearMonth> {
        None
    }

    fn to_doc(&self, refs: &dyn InstrumentRefs) -> Self::Doc;

    fn from_doc(doc: Self::Doc, refs: &dyn InstrumentRefs) -> Imported<Self>;

    fn into_any(self) -> AnyPayload;

    fn from_any(any: AnyPayload) -> Option<Self>;
}

impl Payload for Category {
    const COLLECTION: Collection = Collection::Categories;
    type Doc = Category;

    fn natural_key(&self) -> Option<String> {
        Some(format!("{}/{}", self.kind.as_str(), self.name))
    }

    fn as_category(&self) -> Option<&Category> {
        Some(self)
    }

    fn to_doc(&self, _refs: &dyn InstrumentRefs) -> Self::Doc {
        self.clone()
    }

    fn from_doc(doc: Self::Doc, _refs: &dyn InstrumentRefs) -> Imported<Self> {
        Imported { payload: doc, dangling_ref: false }
    }

    fn into_any(self) -> AnyPayload {
        AnyPayload::Category(self)
    }

    fn from_any(any: AnyPayload) -> Option<Self> {
        match any {
            AnyPayload::Category(c) => Some(c),
            _ => None,
        }
    }
}

impl Payload for Instrument {
    const COLLECTION: Collection = Collection::Instruments;
    type Doc = Instrument;

    fn natural_key(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn to_doc(&self, _refs: &dyn InstrumentRefs) -> Self::Doc {
        self.clone()
    }

    fn from_doc(doc: Self::Doc, _refs: &dyn InstrumentRefs) -> Imported<Self> {
        Imported { payload: doc, dangling_ref: false }
    }

    fn into_any(self) -> AnyPayload {
        AnyPayload::Instrument(self)
    }

    fn from_any(any: AnyPayload) -> Option<Self> {
        match any {
            AnyPayload::Instrument(i) => Some(i),
            _ => None,
        }
    }
}

impl Payload for LedgerEntry {
    const COLLECTION: Collection = Collection::Ledger;
    type Doc = LedgerDoc;

    fn ledger_month(&self) -> Option<YearMonth> {
        Some(self.month())
    }

    fn to_doc(&self, refs: &dyn InstrumentRefs) -> Self::Doc {
        self.with_instrument(self.instrument.and_then(|id| refs.export(id)))
    }

    fn from_doc(doc: Self::Doc, refs: &dyn InstrumentRefs) -> Imported<Self> {
        let resolved = doc.instrument.as_ref().map(|gid| refs.import(gid));
        let dangling_ref = matches!(resolved, Some(None));
        Imported {
            payload: doc.with_instrument(resolved.flatten()),
            dangling_ref,
        }
    }

    fn into_any(self) -> AnyPayload {
        AnyPayload::Ledger(self)
    }

    fn from_any(any: AnyPayload) -> Option<Self> {
        match any {
            AnyPayload::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

impl Payload for RecurringSchedule {
    const COLLECTION: Collection = Collection::Recurring;
    type Doc = RecurringDoc;

    fn to_doc(&self, refs: &dyn InstrumentRefs) -> Self::Doc {
        self.with_instrument(self.instrument.and_then(|id| refs.export(id)))
    }

    fn from_doc(doc: Self::Doc, refs: &dyn InstrumentRefs) -> Imported<Self> {
        let resolved = doc.instrument.as_ref().map(|gid| refs.import(gid));
        let dangling_ref = matches!(resolved, Some(None));
        Imported {
            payload: doc.with_instrument(resolved.flatten()),
            dangling_ref,
        }
    }

    fn into_any(self) -> AnyPayload {
        AnyPayload::Recurring(self)
    }

    fn from_any(any: AnyPayload) -> Option<Self> {
        match any {
            AnyPayload::Recurring(r) => Some(r),
            _ => None,
        }
    }
}

/// Type-erased payload, used where one container holds every collection.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyPayload {
    Category(Category),
    Instrument(Instrument),
    Ledger(LedgerEntry),
    Recurring(RecurringSchedule),
}

impl AnyPayload {
    #[must_use]
    pub fn collection(&self) -> Collection {
        match self {
            Self::Category(_) => Collection::Categories,
            Self::Instrument(_) => Collection::Instruments,
            Self::Ledger(_) => Collection::Ledger,
            Self::Recurring(_) => Collection::Recurring,
        }
    }
}

/// One record as it travels in a snapshot: tombstone flag plus wire document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord<D> {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_deleted: bool,
    #[serde(flatten)]
    pub doc: D,
}

impl<D> SnapshotRecord<D> {
    pub fn live(doc: D) -> Self {
        Self { is_deleted: false, doc }
    }

    pub fn tombstone(doc: D) -> Self {
        Self { is_deleted: true, doc }
    }
}

/// One collection of a snapshot, indexed purely by global id.
pub type CollectionMap<D> = BTreeMap<GlobalId, SnapshotRecord<D>>;

/// Tombstone flags arrive as booleans or as 0/1 integers from older writers.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Null(()),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(0) | Flag::Null(()) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(other) => Err(de::Error::custom(format!("invalid tombstone flag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn dec(v: &str) -> Decimal {
        v.parse().unwrap()
    }

    struct OneCard;

    impl InstrumentRefs for OneCard {
        fn export(&self, local: LocalId) -> Option<GlobalId> {
            (local == LocalId(7)).then(|| GlobalId::new("card-7"))
        }

        fn import(&self, global: &GlobalId) -> Option<LocalId> {
            (global.as_str() == "card-7").then_some(LocalId(7))
        }
    }

    fn entry(kind: EntryKind, amount: Decimal, instrument: Option<LocalId>) -> LedgerEntry {
        LedgerEntry {
            kind,
            description: "coffee".into(),
            amount,
            category: "Food".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 9)
                .unwrap()
                .and_hms_opt(8, 30, 0)
                .unwrap(),
            instrument,
        }
    }

    #[test]
    fn test_cash_delta_excludes_card_spending() {
        assert_eq!(entry(EntryKind::Income, dec("10"), None).cash_delta(), Some(dec("10")));
        assert_eq!(entry(EntryKind::Expense, dec("4"), None).cash_delta(), Some(dec("-4")));
        assert_eq!(entry(EntryKind::Expense, dec("4"), Some(LocalId(7))).cash_delta(), None);
        assert_eq!(
            entry(EntryKind::Repayment, dec("50"), Some(LocalId(7))).cash_delta(),
            Some(dec("-50"))
        );
    }

    #[test]
    fn test_ledger_doc_round_trips_known_instrument() {
        let local = entry(EntryKind::Expense, dec("4.50"), Some(LocalId(7)));
        let doc = local.to_doc(&OneCard);
        assert_eq!(doc.instrument, Some(GlobalId::new("card-7")));

        let back = LedgerEntry::from_doc(doc, &OneCard);
        assert!(!back.dangling_ref);
        assert_eq!(back.payload, local);
    }

    #[test]
    fn test_unknown_instrument_imports_as_cash() {
        let mut doc = entry(EntryKind::Expense, dec("4"), None).to_doc(&NoRefs);
        doc.instrument = Some(GlobalId::new("card-unknown"));

        let imported = LedgerEntry::from_doc(doc, &OneCard);
        assert!(imported.dangling_ref);
        assert_eq!(imported.payload.instrument, None);
    }

    #[test]
    fn test_natural_keys() {
        let cat = Category::new("Food", CategoryKind::Expense);
        assert_eq!(cat.natural_key().as_deref(), Some("expense/Food"));

        let card = Instrument {
            name: "Blue".into(),
            credit_limit: dec("1000"),
            closing_day: 25,
            color_tag: "#00f".into(),
        };
        assert_eq!(card.natural_key().as_deref(), Some("Blue"));
        assert_eq!(entry(EntryKind::Income, dec("1"), None).natural_key(), None);
    }

    #[test]
    fn test_snapshot_record_accepts_integer_flags() {
        let rec: SnapshotRecord<Category> = serde_json::from_value(json!({
            "name": "Food", "kind": "expense", "keywords": ["rice"], "is_deleted": 1
        }))
        .unwrap();
        assert!(rec.is_deleted);
        assert_eq!(rec.doc.keywords, vec!["rice".to_string()]);

        let rec: SnapshotRecord<Category> =
            serde_json::from_value(json!({"name": "Food", "kind": "expense"})).unwrap();
        assert!(!rec.is_deleted);
    }

    #[test]
    fn test_missing_instrument_reads_as_cash() {
        let doc: SnapshotRecord<LedgerDoc> = serde_json::from_value(json!({
            "kind": "expense", "description": "lunch", "amount": "120.00",
            "category": "Food", "timestamp": "2024-03-09T12:00:00"
        }))
        .unwrap();
        assert_eq!(doc.doc.instrument, None);

        let schedule: SnapshotRecord<RecurringDoc> = serde_json::from_value(json!({
            "day_of_month": 5, "description": "rent", "amount": "900",
            "category": "Other", "is_deleted": false
        }))
        .unwrap();
        assert_eq!(schedule.doc.instrument, None);
        assert!(!schedule.doc.auto_pay);

        let stored: LedgerEntry = serde_json::from_value(json!({
            "kind": "income", "description": "pay", "amount": "10",
            "category": "Salary", "timestamp": "2024-03-09T12:00:00"
        }))
        .unwrap();
        assert_eq!(stored.instrument, None);
    }

    #[test]
    fn test_snapshot_record_rejects_bad_flag() {
        let result: Result<SnapshotRecord<Category>, _> = serde_json::from_value(json!({
            "name": "Food", "kind": "expense", "is_deleted": 7
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_any_payload_round_trip() {
        let cat = Category::new("Salary", CategoryKind::Income);
        let any = cat.clone().into_any();
        assert_eq!(any.collection(), Collection::Categories);
        assert_eq!(Category::from_any(any.clone()), Some(cat));
        assert_eq!(Instrument::from_any(any), None);
    }

    #[test]
    fn test_collection_serializes_as_map_key() {
        let mut map = BTreeMap::new();
        map.insert(Collection::Ledger, 1);
        assert_eq!(serde_json::to_value(&map).unwrap(), json!({"ledger": 1}));
    }
}
