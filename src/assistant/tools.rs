//! Tools the generation backend may call while composing a reply.
//!
//! A tool is a named capability with declared input/output JSON schemas.
//! The registry validates arguments against the input schema before the
//! call and the result against the output schema after it.

use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("invalid schema for tool '{tool}': {message}")]
    Schema { tool: String, message: String },

    #[error("tool '{tool}' rejected its {stage}: {message}")]
    Validation {
        tool: String,
        stage: &'static str,
        message: String,
    },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

/// Declaration handed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    fn output_schema(&self) -> Value;
    async fn invoke(&self, input: Value) -> Result<Value, ToolError>;
}

fn validate(tool: &str, stage: &'static str, schema: &Value, instance: &Value) -> Result<(), ToolError> {
    let compiled = JSONSchema::compile(schema).map_err(|e| ToolError::Schema {
        tool: tool.to_string(),
        message: e.to_string(),
    })?;

    let result = compiled.validate(instance);
    if let Err(errors) = result {
        let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(ToolError::Validation {
            tool: tool.to_string(),
            stage,
            message,
        });
    }
    Ok(())
}

/// Tools available to one assistant profile.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Register a tool; a tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                output_schema: t.output_schema(),
            })
            .collect()
    }

    /// Run a tool by name with schema checks on both sides.
    pub async fn call(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;

        // Backends send `null` for tools without parameters.
        let input = if input.is_null() { json!({}) } else { input };
        validate(name, "input", &tool.input_schema(), &input)?;

        let output = tool.invoke(input).await?;
        validate(name, "output", &tool.output_schema(), &output)?;

        tracing::debug!(tool = name, "tool call completed");
        Ok(output)
    }
}

/// Contact details for the site administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminContact {
    pub name: String,
    pub email: String,
}

pub const ADMIN_CONTACT_TOOL: &str = "getAdminContact";

/// Lets an assistant point users to a human when a question is outside its
/// topic.
pub struct AdminContactTool {
    contact: AdminContact,
}

impl AdminContactTool {
    pub fn new(contact: AdminContact) -> Self {
        Self { contact }
    }
}

#[async_trait]
impl Tool for AdminContactTool {
    fn name(&self) -> &str {
        ADMIN_CONTACT_TOOL
    }

    fn description(&self) -> &str {
        "Returns the name and email of the ClassHub administrator. Use it when the user asks \
         something outside the resources library so you can refer them to a person."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "email": { "type": "string" }
            },
            "required": ["name", "email"]
        })
    }

    async fn invoke(&self, _input: Value) -> Result<Value, ToolError> {
        serde_json::to_value(&self.contact).map_err(|e| ToolError::Failed {
            tool: ADMIN_CONTACT_TOOL.to_string(),
            message: e.to_string(),
        })
    }
}
