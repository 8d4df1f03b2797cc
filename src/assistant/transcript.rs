use crate::models::chat::ChatMessage;

use super::ChatAssistant;

/// Conversation held by one chat surface. Lives only as long as the
/// surface; nothing is persisted.
#[derive(Debug, Clone, Default)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
}

impl ChatTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Send `input` to `assistant` and append both turns. Blank input is
    /// ignored and returns `None`.
    pub async fn exchange(&mut self, assistant: &ChatAssistant, input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let reply = assistant.reply(&self.messages, input).await;
        self.messages.push(ChatMessage::user(input));
        self.messages.push(ChatMessage::model(reply.clone()));
        Some(reply)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
