//! Language model collaborator: chat types and the streaming client seam.
//!
//! The turn pipeline only needs one thing from a model backend: open a
//! streaming chat completion and yield [`StreamEvent`]s. [`ChatClient`] is
//! that seam. [`api::ApiChatClient`] speaks the OpenAI-compatible protocol
//! over HTTP, [`scripted::ScriptedChatClient`] replays canned deltas for
//! offline runs and tests.

pub mod api;
pub mod prompt;
pub mod scripted;
pub mod sse;
pub mod tools;

use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    /// Wire name used by OpenAI-compatible APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool result message.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Raw JSON arguments as streamed by the model.
    pub arguments: String,
}

/// One message in a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool calls made by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call id a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    /// Assistant message that carries the tool calls it requested.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(ChatRole::Assistant, content)
        }
    }

    /// Tool result answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }
}

/// Function-calling schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// A streaming chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub tools: Vec<ToolSpec>,
}

/// Incremental output of a chat completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of generated text.
    Delta(String),
    /// A complete tool call. Emitted once its arguments have fully streamed.
    ToolCall(ToolCall),
    /// End of the response.
    Done,
    /// Terminal stream failure.
    Error(String),
}

/// Boxed stream of [`StreamEvent`]s.
pub type DeltaStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Opens streaming chat completions.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Open a streaming completion for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Llm`](crate::error::KgError::Llm) when the request
    /// is rejected before any event is produced.
    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream>;
}
