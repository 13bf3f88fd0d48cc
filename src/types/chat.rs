//! Chat endpoint request and response bodies

use serde::{Deserialize, Serialize};

use crate::{Result, TollgateError};

/// Longest accepted user message, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// `POST /api/v1/chat` request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Existing thread to continue; a new one is started when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_name: None,
            conversation_id: None,
        }
    }

    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Reject empty or oversized messages before any governance work.
    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(TollgateError::InvalidInput("message must not be empty".into()));
        }
        if self.message.len() > MAX_MESSAGE_BYTES {
            return Err(TollgateError::InvalidInput(format!(
                "message exceeds {MAX_MESSAGE_BYTES} bytes"
            )));
        }
        Ok(())
    }
}

/// Speaker of a [`ChatMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Human,
    Ai,
}

/// A message in the format chat UIs expect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Human,
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Ai,
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// `POST /api/v1/chat` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub messages: Vec<ChatMessage>,
    pub thread_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_optional_fields_default() {
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(req, ChatRequest::new("hi"));
    }

    #[test]
    fn empty_message_is_invalid() {
        assert!(ChatRequest::new("   ").validate().is_err());
        assert!(ChatRequest::new("find a condo").validate().is_ok());
    }

    #[test]
    fn message_serializes_type_field() {
        let json = serde_json::to_value(ChatMessage::ai("done")).unwrap();
        assert_eq!(json["type"], "ai");
        assert_eq!(json["role"], "assistant");
    }
}
