use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::Operation;

/// A store operation rejected for insufficient permissions.
///
/// Built at the call site right after the rejection and handed to whichever
/// listeners are registered at that moment. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionErrorEvent {
    pub path: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource_data: Option<Value>,
}

impl PermissionErrorEvent {
    pub fn new(path: impl Into<String>, operation: Operation) -> Self {
        Self {
            path: path.into(),
            operation,
            request_resource_data: None,
        }
    }

    /// Attach the rejected payload for diagnostics.
    pub fn with_request_data(mut self, data: Value) -> Self {
        self.request_resource_data = Some(data);
        self
    }

    /// Structured description of the denied request, as logged.
    pub fn context(&self) -> Value {
        let mut ctx = json!({
            "method": self.operation,
            "path": self.path,
        });
        if let Some(data) = &self.request_resource_data {
            ctx["request"] = json!({ "resource": { "data": data } });
        }
        ctx
    }
}

impl std::fmt::Display for PermissionErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "missing or insufficient permissions: the following request was denied: {}",
            self.context()
        )
    }
}

impl std::error::Error for PermissionErrorEvent {}
