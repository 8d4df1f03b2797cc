//! Document store collaborator.
//!
//! The feed only needs three capabilities from the backing database:
//! ordered + limited live queries over a collection, partial-field updates
//! by document id, and inserts with store-assigned `id` / `created_at`.
//! Failures are classified so that authorization rejections can be told
//! apart from everything else.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod postgres;

/// Fields assigned by the store; callers may never write them.
pub const RESERVED_FIELDS: &[&str] = &["id", "created_at"];

/// Kind of operation a store request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document: opaque id plus its field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

/// Ordered, limited query over one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveQuery {
    pub collection: String,
    pub order_by: String,
    pub descending: bool,
    pub limit: usize,
}

impl LiveQuery {
    pub fn newest_first(collection: impl Into<String>, order_by: impl Into<String>, limit: usize) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            descending: true,
            limit,
        }
    }
}

/// Every item is the full, ordered result set at that moment.
pub type SnapshotStream = BoxStream<'static, Result<Vec<Document>, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing or insufficient permissions: {operation} on {path}")]
    PermissionDenied { path: String, operation: Operation },

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("live query closed: {0}")]
    Closed(String),
}

impl StoreError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied { .. })
    }
}

/// Path of a single document, e.g. `notifications/abc123`.
pub fn document_path(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

/// Reject writes to store-assigned fields.
pub(crate) fn check_writable(patch: &Map<String, Value>) -> Result<(), StoreError> {
    if let Some(field) = patch.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str())) {
        return Err(StoreError::Invalid(format!("field '{}' is assigned by the store", field)));
    }
    Ok(())
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a live query. The returned stream yields the current result set
    /// first and again after every change to the collection. An error item
    /// terminates the subscription.
    async fn watch(&self, query: LiveQuery) -> Result<SnapshotStream, StoreError>;

    /// Merge `patch` into the fields of an existing document.
    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), StoreError>;

    /// Insert a document; `id` and `created_at` are assigned by the store.
    async fn insert(&self, collection: &str, data: Map<String, Value>) -> Result<Document, StoreError>;
}
