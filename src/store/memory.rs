//! In-process document store used for local development and tests.
//!
//! Each collection carries a `watch` version counter; live queries re-run
//! the query whenever the counter moves. Access rules deny individual
//! `(collection, operation)` pairs to reproduce authorization failures.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{
    check_writable, document_path, Document, DocumentStore, LiveQuery, Operation, SnapshotStream,
    StoreError,
};

struct Collection {
    docs: HashMap<String, Map<String, Value>>,
    version: watch::Sender<u64>,
}

impl Collection {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            docs: HashMap::new(),
            version,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[derive(Default)]
struct Inner {
    collections: RwLock<HashMap<String, Collection>>,
    denied: RwLock<HashSet<(String, Operation)>>,
}

impl Inner {
    fn check(&self, collection: &str, operation: Operation, path: &str) -> Result<(), StoreError> {
        let denied = self.denied.read().unwrap_or_else(PoisonError::into_inner);
        if denied.contains(&(collection.to_string(), operation)) {
            return Err(StoreError::PermissionDenied {
                path: path.to_string(),
                operation,
            });
        }
        Ok(())
    }

    fn snapshot(&self, query: &LiveQuery) -> Result<Vec<Document>, StoreError> {
        self.check(&query.collection, Operation::List, &query.collection)?;

        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let mut docs: Vec<Document> = collections
            .get(&query.collection)
            .map(|c| {
                c.docs
                    .iter()
                    .map(|(id, data)| Document {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        docs.sort_by(|a, b| {
            let ord = compare_values(a.data.get(&query.order_by), b.data.get(&query.order_by));
            let ord = if query.descending { ord.reverse() } else { ord };
            ord.then_with(|| a.id.cmp(&b.id))
        });
        docs.truncate(query.limit);
        Ok(docs)
    }

    fn subscribe(&self, collection: &str) -> watch::Receiver<u64> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        collections
            .entry(collection.to_string())
            .or_insert_with(Collection::new)
            .version
            .subscribe()
    }
}

/// RFC 3339 strings compare as instants, other strings lexically, numbers
/// numerically, missing values sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Cheaply cloneable handle; clones share the same collections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `operation` on `collection` with a permission error from now on.
    pub fn deny(&self, collection: &str, operation: Operation) {
        let mut denied = self.inner.denied.write().unwrap_or_else(PoisonError::into_inner);
        denied.insert((collection.to_string(), operation));
    }

    pub fn allow(&self, collection: &str, operation: Operation) {
        let mut denied = self.inner.denied.write().unwrap_or_else(PoisonError::into_inner);
        denied.remove(&(collection.to_string(), operation));
    }

    /// Write a fixture document verbatim, including its `created_at`.
    pub fn seed(&self, collection: &str, id: &str, data: Map<String, Value>) {
        let mut collections = self.inner.collections.write().unwrap_or_else(PoisonError::into_inner);
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(Collection::new);
        entry.docs.insert(id.to_string(), data);
        entry.bump();
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        let collections = self.inner.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .map(|data| Document {
                id: id.to_string(),
                data: data.clone(),
            })
    }

    /// Number of open live queries on `collection`.
    pub fn watcher_count(&self, collection: &str) -> usize {
        let collections = self.inner.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .map(|c| c.version.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn watch(&self, query: LiveQuery) -> Result<SnapshotStream, StoreError> {
        let inner = self.inner.clone();
        let versions = WatchStream::new(inner.subscribe(&query.collection));

        tracing::debug!(
            collection = %query.collection,
            limit = query.limit,
            "memory store: live query opened"
        );

        // Permission is evaluated per delivery, so a rule change mid-stream
        // surfaces on the next change.
        Ok(versions.map(move |_| inner.snapshot(&query)).boxed())
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), StoreError> {
        let path = document_path(collection, id);
        self.inner.check(collection, Operation::Update, &path)?;
        check_writable(&patch)?;

        let mut collections = self.inner.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        let doc = coll
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        doc.extend(patch);
        coll.bump();
        Ok(())
    }

    async fn insert(&self, collection: &str, mut data: Map<String, Value>) -> Result<Document, StoreError> {
        self.inner.check(collection, Operation::Create, collection)?;
        check_writable(&data)?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        data.insert("created_at".into(), Value::String(format_timestamp(Utc::now())));

        let mut collections = self.inner.collections.write().unwrap_or_else(PoisonError::into_inner);
        let coll = collections
            .entry(collection.to_string())
            .or_insert_with(Collection::new);
        coll.docs.insert(id.clone(), data.clone());
        coll.bump();

        Ok(Document { id, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture(message: &str, minute: u32) -> Map<String, Value> {
        json!({
            "message": message,
            "created_at": format!("2024-03-01T10:{:02}:00.000000Z", minute),
            "read": false,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_live_query_orders_and_limits() {
        let store = MemoryStore::new();
        for minute in 0..5 {
            store.seed("notifications", &format!("n{}", minute), fixture("m", minute));
        }

        let mut stream = store
            .watch(LiveQuery::newest_first("notifications", "created_at", 3))
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let ids: Vec<_> = first.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["n4", "n3", "n2"]);
    }

    #[tokio::test]
    async fn test_live_query_orders_timestamps_as_instants() {
        let store = MemoryStore::new();
        for minute in 0..10 {
            let data = json!({"message": "m", "created_at": format!("2024-03-01T10:{:02}:00Z", minute)});
            store.seed("notifications", &format!("n{}", minute), data.as_object().cloned().unwrap());
        }
        // 11:00 UTC, written with a negative offset.
        let offset = json!({"message": "late", "created_at": "2024-03-01T09:00:00-02:00"});
        store.seed("notifications", "latest", offset.as_object().cloned().unwrap());
        // 10:09:30 UTC with fractional seconds.
        let fraction = json!({"message": "m", "created_at": "2024-03-01T10:09:30.000000Z"});
        store.seed("notifications", "fraction", fraction.as_object().cloned().unwrap());

        let mut stream = store
            .watch(LiveQuery::newest_first("notifications", "created_at", 10))
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let ids: Vec<_> = first.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(&ids[..3], &["latest", "fraction", "n9"]);
        assert!(!ids.contains(&"n0"));
        assert!(!ids.contains(&"n1"));
    }

    #[test]
    fn test_unparseable_strings_compare_lexically() {
        let a = json!("not a time");
        let b = json!("2024-03-01T10:00:00Z");
        assert_eq!(compare_values(Some(&a), Some(&b)), "not a time".cmp("2024-03-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_live_query_redelivers_on_change() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("first", 1));

        let mut stream = store
            .watch(LiveQuery::newest_first("notifications", "created_at", 10))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 1);

        store.seed("notifications", "b", fixture("second", 2));
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].id, "b");
    }

    #[tokio::test]
    async fn test_denied_list_yields_permission_error() {
        let store = MemoryStore::new();
        store.deny("notifications", Operation::List);

        let mut stream = store
            .watch(LiveQuery::newest_first("notifications", "created_at", 10))
            .await
            .unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("first", 1));

        let patch = json!({"read": true}).as_object().cloned().unwrap();
        store.update("notifications", "a", patch).await.unwrap();

        let doc = store.get("notifications", "a").unwrap();
        assert_eq!(doc.data["read"], json!(true));
        assert_eq!(doc.data["message"], json!("first"));
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = MemoryStore::new();
        let patch = json!({"read": true}).as_object().cloned().unwrap();
        let err = store.update("notifications", "ghost", patch).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(path) if path == "notifications/ghost"));
    }

    #[tokio::test]
    async fn test_denied_update_reports_document_path() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("first", 1));
        store.deny("notifications", Operation::Update);

        let patch = json!({"read": true}).as_object().cloned().unwrap();
        match store.update("notifications", "a", patch).await {
            Err(StoreError::PermissionDenied { path, operation }) => {
                assert_eq!(path, "notifications/a");
                assert_eq!(operation, Operation::Update);
            }
            other => panic!("expected permission error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_timestamp() {
        let store = MemoryStore::new();
        let data = json!({"message": "hello"}).as_object().cloned().unwrap();
        let doc = store.insert("notifications", data).await.unwrap();

        assert!(!doc.id.is_empty());
        assert!(doc.data["created_at"].as_str().unwrap().ends_with('Z'));
        assert!(store.get("notifications", &doc.id).is_some());
    }
}
