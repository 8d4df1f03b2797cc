//! Chat assistants.
//!
//! Each assistant is a fixed profile (model, system prompt, temperature,
//! tools, apology) bound to a generation backend. A turn is stateless: the
//! caller owns the transcript and passes it back in as history.

pub mod backend;
pub mod gemini;
pub mod tools;
pub mod transcript;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::models::chat::ChatMessage;

pub use backend::{BackendError, GenerationBackend, GenerationRequest, UnconfiguredBackend};
pub use gemini::GeminiBackend;
pub use tools::{AdminContact, AdminContactTool, Tool, ToolError, ToolRegistry};
pub use transcript::ChatTranscript;

pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.0-flash";

pub const GENERAL_FALLBACK: &str = "Sorry, I had trouble responding.";
pub const RESOURCES_FALLBACK: &str = "Sorry, I couldn't reach the resource assistant. Please try again.";

const GENERAL_INSTRUCTION: &str = "You are the ClassHub Central study assistant. Help students with \
questions about their courses, assignments, schedules and study habits. Keep answers short, friendly \
and accurate. If you do not know something about a specific class, say so and suggest checking the \
class page or asking the instructor.";

const RESOURCES_INSTRUCTION: &str = "You are the ClassHub Central resources assistant. Only answer \
questions about the shared resources library: study guides, lecture notes, past papers and where to \
find them. If a question falls outside the resources library, call getAdminContact and refer the \
user to the administrator by name and email instead of answering.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantKind {
    General,
    Resources,
}

impl AssistantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssistantKind::General => "general",
            AssistantKind::Resources => "resources",
        }
    }
}

impl fmt::Display for AssistantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssistantKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" | "chat" => Ok(AssistantKind::General),
            "resources" | "resource" => Ok(AssistantKind::Resources),
            other => Err(format!("unknown assistant '{}'", other)),
        }
    }
}

/// Fixed generation settings for one assistant.
#[derive(Clone)]
pub struct AssistantProfile {
    pub kind: AssistantKind,
    pub model: String,
    pub system_instruction: String,
    pub temperature: f32,
    pub fallback_reply: String,
    pub tools: ToolRegistry,
}

impl AssistantProfile {
    pub fn general(model: impl Into<String>) -> Self {
        Self {
            kind: AssistantKind::General,
            model: model.into(),
            system_instruction: GENERAL_INSTRUCTION.to_string(),
            temperature: 0.7,
            fallback_reply: GENERAL_FALLBACK.to_string(),
            tools: ToolRegistry::new(),
        }
    }

    pub fn resources(model: impl Into<String>, admin: AdminContact) -> Self {
        Self {
            kind: AssistantKind::Resources,
            model: model.into(),
            system_instruction: RESOURCES_INSTRUCTION.to_string(),
            temperature: 0.3,
            fallback_reply: RESOURCES_FALLBACK.to_string(),
            tools: ToolRegistry::new().with(Arc::new(AdminContactTool::new(admin))),
        }
    }
}

#[derive(Clone)]
pub struct ChatAssistant {
    backend: Arc<dyn GenerationBackend>,
    profile: AssistantProfile,
}

impl ChatAssistant {
    pub fn new(backend: Arc<dyn GenerationBackend>, profile: AssistantProfile) -> Self {
        Self { backend, profile }
    }

    pub fn kind(&self) -> AssistantKind {
        self.profile.kind
    }

    pub fn profile(&self) -> &AssistantProfile {
        &self.profile
    }

    /// History followed by the new user turn, with the profile's fixed
    /// parameters.
    pub fn build_request(&self, history: &[ChatMessage], input: &str) -> GenerationRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(input));

        GenerationRequest {
            model: self.profile.model.clone(),
            system_instruction: self.profile.system_instruction.clone(),
            messages,
            temperature: self.profile.temperature,
        }
    }

    /// One reply for `input`. Never fails: backend errors become the
    /// profile's apology and a reply with no text becomes `""`.
    pub async fn reply(&self, history: &[ChatMessage], input: &str) -> String {
        let request = self.build_request(history, input);
        let assistant = self.profile.kind.as_str();

        match self.backend.generate(&request, &self.profile.tools).await {
            Ok(Some(text)) => {
                metrics::global().chat_request(assistant, "ok");
                text
            }
            Ok(None) => {
                metrics::global().chat_request(assistant, "empty");
                tracing::debug!(assistant, "backend returned no text");
                String::new()
            }
            Err(e) => {
                metrics::global().chat_request(assistant, "fallback");
                tracing::warn!(assistant, error = %e, "chat generation failed");
                self.profile.fallback_reply.clone()
            }
        }
    }
}
