use async_trait::async_trait;
use thiserror::Error;

use super::tools::{ToolError, ToolRegistry};
use crate::models::chat::ChatMessage;

/// One generation call: the ordered transcript plus the fixed profile
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub system_instruction: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("generation request failed: {0}")]
    Http(String),

    #[error("generation backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode generation response: {0}")]
    Decode(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("model kept calling tools after {0} rounds")]
    ToolLoop(usize),

    #[error("generation backend is not configured: {0}")]
    NotConfigured(String),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Produce the reply text for `request`. `Ok(None)` means the model
    /// answered without any text.
    async fn generate(
        &self,
        request: &GenerationRequest,
        tools: &ToolRegistry,
    ) -> Result<Option<String>, BackendError>;
}

/// Stands in when no API key is configured; every call fails so the
/// assistant answers with its apology.
pub struct UnconfiguredBackend;

#[async_trait]
impl GenerationBackend for UnconfiguredBackend {
    async fn generate(
        &self,
        _request: &GenerationRequest,
        _tools: &ToolRegistry,
    ) -> Result<Option<String>, BackendError> {
        Err(BackendError::NotConfigured("GEMINI_API_KEY is not set".into()))
    }
}
