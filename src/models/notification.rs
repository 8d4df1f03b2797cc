use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Document;

/// A single entry of the `notifications` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub r#type: String, // 'type' is a reserved keyword
}

impl NotificationRecord {
    /// Decode a stored document. The document id always wins over any `id`
    /// key that may have leaked into the payload.
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        let mut data = doc.data;
        data.insert("id".into(), Value::String(doc.id));
        serde_json::from_value(Value::Object(data))
    }
}
