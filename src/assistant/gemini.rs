//! Gemini `generateContent` backend.
//!
//! Non-streaming only. Function calls requested by the model are executed
//! through the profile's [`ToolRegistry`] and their results sent back as
//! `functionResponse` parts until the model answers with text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::backend::{BackendError, GenerationBackend, GenerationRequest};
use super::tools::{ToolRegistry, ToolSpec};
use crate::models::chat::{ChatMessage, ChatRole};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Model turns spent on tool calls before giving up.
const MAX_TOOL_ROUNDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

fn to_content(message: &ChatMessage) -> Content {
    Content {
        role: Some(message.role.as_str().to_string()),
        parts: vec![Part::text(message.content.clone())],
    }
}

fn declaration(spec: ToolSpec) -> FunctionDeclaration {
    // Gemini rejects an object schema with no properties; parameterless
    // functions omit `parameters` entirely.
    let has_properties = spec
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|p| !p.is_empty());
    FunctionDeclaration {
        name: spec.name,
        description: spec.description,
        parameters: has_properties.then_some(spec.input_schema),
    }
}

/// Translate a generation request into the Gemini wire format.
pub fn build_request(request: &GenerationRequest, tools: &ToolRegistry) -> GenerateContentRequest {
    let system_instruction = (!request.system_instruction.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part::text(request.system_instruction.clone())],
    });

    let declarations: Vec<FunctionDeclaration> = tools.specs().into_iter().map(declaration).collect();
    let tools = if declarations.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclarations {
            function_declarations: declarations,
        }]
    };

    GenerateContentRequest {
        contents: request.messages.iter().map(to_content).collect(),
        system_instruction,
        generation_config: GenerationConfig {
            temperature: request.temperature,
        },
        tools,
    }
}

/// Concatenated text of the first candidate, or `None` when it has none.
pub fn reply_text(response: &GenerateContentResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn function_calls(response: &GenerateContentResponse) -> Vec<FunctionCall> {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.function_call.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Extract the message from a Gemini error body. Gemini sends either
/// `{"error": {...}}` or the same object wrapped in an array.
pub fn error_message(body: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(body).ok()?;
    let err = if json.is_array() {
        json.as_array()?.first()?.get("error")?
    } else {
        json.get("error")?
    };
    let message = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
    match err.get("status").and_then(Value::as_str) {
        Some(status) => Some(format!("{}: {}", status, message)),
        None => Some(message.to_string()),
    }
}

pub struct GeminiBackend {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_retries(api_key, base_url, 3)
    }

    /// `max_retries` applies to transient failures (connect errors, 5xx, 429).
    pub fn with_retries(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        max_retries: u32,
    ) -> Result<Self, BackendError> {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::Http(format!("failed to build HTTP client: {}", e)))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model
        )
    }

    async fn send(&self, model: &str, body: &GenerateContentRequest) -> Result<GenerateContentResponse, BackendError> {
        let payload = serde_json::to_vec(body).map_err(|e| BackendError::Decode(e.to_string()))?;

        let resp = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Gemini request failed after retries: {}", e);
                BackendError::Http(e.to_string())
            })?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| BackendError::Http(e.to_string()))?;

        if !status.is_success() {
            let message = error_message(&bytes)
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate(
        &self,
        request: &GenerationRequest,
        tools: &ToolRegistry,
    ) -> Result<Option<String>, BackendError> {
        let mut body = build_request(request, tools);

        for round in 0..=MAX_TOOL_ROUNDS {
            let response = self.send(&request.model, &body).await?;
            let calls = function_calls(&response);
            if calls.is_empty() {
                return Ok(reply_text(&response));
            }
            if round == MAX_TOOL_ROUNDS {
                break;
            }

            let mut parts = Vec::with_capacity(calls.len());
            for call in &calls {
                tracing::debug!(tool = %call.name, round, "model requested tool call");
                let output = tools.call(&call.name, call.args.clone()).await?;
                let response = match output {
                    Value::Object(map) => Value::Object(map),
                    other => {
                        let mut wrapped = Map::new();
                        wrapped.insert("result".into(), other);
                        Value::Object(wrapped)
                    }
                };
                parts.push(Part {
                    function_response: Some(FunctionResponse {
                        name: call.name.clone(),
                        response,
                    }),
                    ..Default::default()
                });
            }

            // Echo the model's turn so the function responses line up with
            // the calls that produced them.
            let model_turn = response
                .candidates
                .into_iter()
                .next()
                .and_then(|c| c.content)
                .map(|mut content| {
                    content.role = Some(ChatRole::Model.as_str().to_string());
                    content
                })
                .unwrap_or_else(|| Content {
                    role: Some(ChatRole::Model.as_str().to_string()),
                    parts: calls
                        .iter()
                        .map(|call| Part {
                            function_call: Some(call.clone()),
                            ..Default::default()
                        })
                        .collect(),
                });
            body.contents.push(model_turn);
            body.contents.push(Content {
                role: Some(ChatRole::User.as_str().to_string()),
                parts,
            });
        }

        Err(BackendError::ToolLoop(MAX_TOOL_ROUNDS))
    }
}
