use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::chunk::SourceAttribution;
use crate::domain::collection::{CollectionId, CollectionVersion};
use crate::domain::tool::ToolCallRecord;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub index: u32,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceAttribution>,
    pub created_at: DateTime<Utc>,
}

/// Conversation transcript pinned to one collection version for its lifetime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub collection_id: CollectionId,
    pub collection_version: u64,
    pub messages: Vec<Message>,
    pub status: SessionStatus,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn start(
        session_id: SessionId,
        user_id: impl Into<String>,
        version: &CollectionVersion,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: user_id.into(),
            collection_id: version.collection_id.clone(),
            collection_version: version.version_number,
            messages: Vec::new(),
            status: SessionStatus::Active,
            degraded: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-opens a stored session for a follow-up request. The pinned version is kept.
    pub fn resume(mut self) -> Self {
        self.status = SessionStatus::Active;
        self.degraded = false;
        self.updated_at = Utc::now();
        self
    }

    pub fn next_index(&self) -> u32 {
        self.messages.last().map(|message| message.index + 1).unwrap_or(0)
    }

    pub fn append_user(&mut self, content: impl Into<String>) -> u32 {
        self.push(MessageRole::User, content.into(), None, Vec::new())
    }

    pub fn append_assistant(
        &mut self,
        content: impl Into<String>,
        sources: Vec<SourceAttribution>,
    ) -> u32 {
        self.push(MessageRole::Assistant, content.into(), None, sources)
    }

    pub fn append_tool_result(&mut self, record: ToolCallRecord) -> u32 {
        let content = record.model_content();
        self.push(MessageRole::Tool, content, Some(record), Vec::new())
    }

    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn push(
        &mut self,
        role: MessageRole,
        content: String,
        tool_call: Option<ToolCallRecord>,
        sources: Vec<SourceAttribution>,
    ) -> u32 {
        let index = self.next_index();
        let now = Utc::now();
        self.messages.push(Message { index, role, content, tool_call, sources, created_at: now });
        self.updated_at = now;
        index
    }
}
