use serde::{Deserialize, Serialize};

/// Who authored a chat turn. The web client historically sent `bot` for
/// model turns, so it is accepted as an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    #[serde(alias = "bot", alias = "assistant")]
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_role_alias() {
        let msg: ChatMessage = serde_json::from_str(r#"{"role":"bot","content":"hello"}"#).unwrap();
        assert_eq!(msg.role, ChatRole::Model);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "model");
    }
}
