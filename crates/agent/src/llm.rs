use async_trait::async_trait;
use futures::stream::BoxStream;
use ragway_core::domain::session::Message;
use ragway_core::domain::tool::{ToolDescriptor, ToolId};
use ragway_core::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_id: ToolId,
    pub arguments: Value,
}

/// One item of a model turn. A well-behaved turn ends with `End`.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCallRequest(ToolCallRequest),
    Error { kind: ErrorKind, message: String },
    End,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub turn: u32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model provider unavailable: {0}")]
    Unavailable(String),
    #[error("model provider returned an unexpected response: {0}")]
    Protocol(String),
}

pub type ModelEventStream = BoxStream<'static, ModelEvent>;

/// Streaming chat model. Dropping the returned stream abandons the turn.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError>;
}
