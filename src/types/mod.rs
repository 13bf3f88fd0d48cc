//! Public types for the Tollgate API.

mod agent;
mod chat;

pub use agent::{AgentQuery, AgentResult, Artifact, Usage};
pub use chat::{ChatMessage, ChatRequest, ChatResponse, MessageType};
