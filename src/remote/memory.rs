//! In-process remote, holding the document as JSON so every fetch and put
//! goes through the same normalization a network driver would.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::document::RawSnapshot;
use super::traits::{RemoteStore, TransportError};

pub struct MemoryRemote {
    document: RwLock<Value>,
    puts: AtomicUsize,
}

impl MemoryRemote {
    /// An empty remote (`null` document).
    #[must_use]
    pub fn new() -> Self {
        Self::with_document(Value::Null)
    }

    /// A remote pre-loaded with a raw document, in any shape a store might return.
    #[must_use]
    pub fn with_document(document: Value) -> Self {
        Self {
            document: RwLock::new(document),
            puts: AtomicUsize::new(0),
        }
    }

    /// Current raw document.
    #[must_use]
    pub fn document(&self) -> Value {
        self.document.read().clone()
    }

    /// Number of successful overwrites so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_snapshot(&self) -> Result<RawSnapshot, TransportError> {
        let document = self.document.read().clone();
        RawSnapshot::from_json(document)
    }

    async fn put_snapshot(&self, snapshot: RawSnapshot) -> Result<(), TransportError> {
        *self.document.write() = snapshot.to_json();
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Collection, GlobalId};
    use serde_json::json;

    #[tokio::test]
    async fn test_new_remote_is_empty() {
        let remote = MemoryRemote::new();
        let snapshot = remote.fetch_snapshot().await.unwrap();
        assert!(snapshot.is_empty());
        assert!(remote.check_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_put_overwrites_document() {
        let remote = MemoryRemote::with_document(json!({
            "categories": {"old": {"name": "Old", "kind": "expense"}}
        }));

        let mut snapshot = RawSnapshot::new();
        snapshot.insert(
            Collection::Categories,
            GlobalId::new("new"),
            json!({"name": "New", "kind": "income", "is_deleted": false}),
        );
        remote.put_snapshot(snapshot).await.unwrap();

        let fetched = remote.fetch_snapshot().await.unwrap();
        let keys: Vec<&str> = fetched
            .records(Collection::Categories)
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["new"]);
        assert_eq!(remote.put_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_document_fails_fetch() {
        let remote = MemoryRemote::with_document(json!("garbage"));
        assert!(matches!(
            remote.fetch_snapshot().await,
            Err(TransportError::Malformed(_))
        ));
        assert!(remote.check_connection().await.is_err());
    }
}
