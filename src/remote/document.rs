// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote document codec.
//!
//! The remote holds one JSON document:
//!
//! ```json
//! {
//!   "categories":   { "<gid>": { "name": "Food", "kind": "expense", ... } },
//!   "cards":        { "<gid>": { ... } },
//!   "transactions": { "<gid>": { "kind": "expense", "amount": "4.50", ..., "is_deleted": false } },
//!   "recurring":    { "<gid>": { ... } },
//!   "last_update":  "2024-03-09T08:30:00Z"
//! }
//! ```
//!
//! [`RawSnapshot`] is that document with each collection normalized into a
//! GlobalID-keyed map of untyped records. Some document stores hand back a
//! collection as a sparse JSON array or as `null`; both normalize here.
//! [`decode_collection`] turns one collection into typed [`SnapshotRecord`]s,
//! skipping (and reporting) records that do not fit the shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::record::{Collection, CollectionMap, GlobalId, Payload, SnapshotRecord};
use super::traits::TransportError;

const LAST_UPDATE_KEY: &str = "last_update";
const LIST_ITEM_ID_KEY: &str = "uuid";

/// Key of a collection inside the remote document.
#[must_use]
pub fn wire_key(collection: Collection) -> &'static str {
    match collection {
        Collection::Categories => "categories",
        Collection::Instruments => "cards",
        Collection::Ledger => "transactions",
        Collection::Recurring => "recurring",
    }
}

/// One remote record that could not be decoded. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("skipped malformed {collection} record {global_id}: {reason}")]
pub struct DataShapeError {
    pub collection: Collection,
    pub global_id: GlobalId,
    pub reason: String,
}

/// A collection-normalized remote document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSnapshot {
    collections: BTreeMap<Collection, BTreeMap<GlobalId, Value>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl RawSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a fetched document. `null` is an empty remote.
    pub fn from_json(document: Value) -> Result<Self, TransportError> {
        let mut root = match document {
            Value::Null => return Ok(Self::default()),
            Value::Object(root) => root,
            other => {
                return Err(TransportError::Malformed(format!(
                    "expected a JSON object at the document root, got {}",
                    type_name(&other)
                )))
            }
        };

        let mut snapshot = Self::default();
        for collection in Collection::ALL {
            let records = match root.remove(wire_key(collection)) {
                None | Some(Value::Null) => BTreeMap::new(),
                Some(Value::Object(map)) => map
                    .into_iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (GlobalId::new(k), v))
                    .collect(),
                // List encoding: holes are null, items keyed by their own uuid
                // when they carry one, else by index.
                Some(Value::Array(items)) => items
                    .into_iter()
                    .enumerate()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(i, v)| (list_item_key(i, &v), v))
                    .collect(),
                Some(other) => {
                    return Err(TransportError::Malformed(format!(
                        "collection '{}' is a {}",
                        wire_key(collection),
                        type_name(&other)
                    )))
                }
            };
            snapshot.collections.insert(collection, records);
        }
        snapshot.last_update = root
            .remove(LAST_UPDATE_KEY)
            .and_then(|v| serde_json::from_value(v).ok());
        Ok(snapshot)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for collection in Collection::ALL {
            let records: Map<String, Value> = self
                .records(collection)
                .map(|(gid, v)| (gid.to_string(), v.clone()))
                .collect();
            root.insert(wire_key(collection).to_string(), Value::Object(records));
        }
        if let Some(at) = self.last_update {
            root.insert(LAST_UPDATE_KEY.to_string(), Value::String(at.to_rfc3339()));
        }
        Value::Object(root)
    }

    pub fn records(&self, collection: Collection) -> impl Iterator<Item = (&GlobalId, &Value)> {
        self.collections.get(&collection).into_iter().flatten()
    }

    pub fn insert(&mut self, collection: Collection, global_id: GlobalId, record: Value) {
        self.collections
            .entry(collection)
            .or_default()
            .insert(global_id, record);
    }

    /// All records of a collection, tombstones included.
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.collections.get(&collection).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(BTreeMap::is_empty)
    }

    /// Records whose tombstone flag is not set.
    #[must_use]
    pub fn live_count(&self, collection: Collection) -> usize {
        self.records(collection).filter(|(_, v)| !is_tombstone(v)).count()
    }
}

fn list_item_key(index: usize, item: &Value) -> GlobalId {
    match item.get(LIST_ITEM_ID_KEY).and_then(Value::as_str) {
        Some(id) if !id.is_empty() => GlobalId::new(id),
        _ => GlobalId::new(index.to_string()),
    }
}

fn is_tombstone(record: &Value) -> bool {
    match record.get("is_deleted") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One collection decoded from a [`RawSnapshot`].
#[derive(Debug, Clone)]
pub struct Decoded<D> {
    pub records: CollectionMap<D>,
    /// Raw form of every record that failed to decode, keyed by GlobalID.
    pub rejected: BTreeMap<GlobalId, Value>,
    pub warnings: Vec<DataShapeError>,
}

impl<D> Default for Decoded<D> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            rejected: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Decode the records of `P`'s collection, skipping malformed ones.
pub fn decode_collection<P: Payload>(raw: &RawSnapshot) -> Decoded<P::Doc> {
    let mut decoded = Decoded::default();
    for (gid, value) in raw.records(P::COLLECTION) {
        match serde_json::from_value::<SnapshotRecord<P::Doc>>(value.clone()) {
            Ok(record) => {
                decoded.records.insert(gid.clone(), record);
            }
            Err(e) => {
                let error = DataShapeError {
                    collection: P::COLLECTION,
                    global_id: gid.clone(),
                    reason: e.to_string(),
                };
                warn!(collection = %P::COLLECTION, global_id = %gid, error = %error.reason, "Skipping malformed remote record");
                decoded.rejected.insert(gid.clone(), value.clone());
                decoded.warnings.push(error);
            }
        }
    }
    decoded
}

/// Write a typed collection into `raw`.
pub fn encode_collection<D: Serialize>(
    raw: &mut RawSnapshot,
    collection: Collection,
    records: &CollectionMap<D>,
) -> Result<(), TransportError> {
    for (gid, record) in records {
        let value = serde_json::to_value(record).map_err(|e| {
            TransportError::Malformed(format!("failed to encode {collection} record {gid}: {e}"))
        })?;
        raw.insert(collection, gid.clone(), value);
    }
    Ok(())
}
