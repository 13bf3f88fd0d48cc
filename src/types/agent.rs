//! Agent collaborator query and result types

use serde::{Deserialize, Serialize};

use super::chat::{ChatMessage, ChatRequest};
use crate::storage::{Category, Format};

/// A single call into the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentQuery {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub thread_id: String,
    /// Whether `thread_id` continues an earlier conversation.
    #[serde(default)]
    pub continues_thread: bool,
}

impl AgentQuery {
    /// Build a query from a chat request, starting a new thread if needed.
    pub fn from_chat(request: &ChatRequest) -> Self {
        let (thread_id, continues_thread) = match &request.conversation_id {
            Some(id) if !id.trim().is_empty() => (id.clone(), true),
            _ => (new_thread_id(), false),
        };
        Self {
            message: request.message.clone(),
            user_name: request.user_name.clone().filter(|n| !n.is_empty()),
            thread_id,
            continues_thread,
        }
    }

    /// The message as the agent sees it, with the user name prefixed.
    pub fn prompt(&self) -> String {
        match &self.user_name {
            Some(name) => format!("[User Name: {name}]\n\n{}", self.message),
            None => self.message.clone(),
        }
    }

    /// Parameters identifying semantically identical queries.
    ///
    /// Fresh threads are keyed on content only, so repeated one-shot
    /// questions share a cache entry; continued threads include the thread.
    pub fn cache_args(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.message,
            "user_name": self.user_name,
            "thread_id": self.continues_thread.then_some(&self.thread_id),
        })
    }
}

fn new_thread_id() -> String {
    format!("thread_{}", chrono::Utc::now().timestamp_millis())
}

/// Provider-reported token usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A document produced by the agent that may be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub category: Category,
    pub logical_id: String,
    pub format: Format,
    pub content: String,
}

/// What the agent returns for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AgentResult {
    /// Content of the final assistant message, if any.
    pub fn reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.kind == super::MessageType::Ai)
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_is_generated_when_absent() {
        let query = AgentQuery::from_chat(&ChatRequest::new("hi"));
        assert!(query.thread_id.starts_with("thread_"));
        assert!(!query.continues_thread);
    }

    #[test]
    fn conversation_id_continues_thread() {
        let query = AgentQuery::from_chat(&ChatRequest::new("hi").conversation_id("thread_7"));
        assert_eq!(query.thread_id, "thread_7");
        assert!(query.continues_thread);
    }

    #[test]
    fn prompt_prefixes_user_name() {
        let query = AgentQuery::from_chat(&ChatRequest::new("find a loft").user_name("Ada"));
        assert_eq!(query.prompt(), "[User Name: Ada]\n\nfind a loft");
    }

    #[test]
    fn fresh_threads_share_cache_args() {
        let a = AgentQuery::from_chat(&ChatRequest::new("hi"));
        let mut b = AgentQuery::from_chat(&ChatRequest::new("hi"));
        b.thread_id = "thread_other".into();
        assert_eq!(a.cache_args(), b.cache_args());
    }

    #[test]
    fn reply_is_last_ai_message() {
        let result = AgentResult {
            messages: vec![
                ChatMessage::human("q"),
                ChatMessage::ai("first"),
                ChatMessage::ai("final"),
            ],
            ..Default::default()
        };
        assert_eq!(result.reply(), Some("final"));
    }
}
