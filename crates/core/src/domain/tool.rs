use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::collection::CollectionVersion;
use crate::domain::session::SessionId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolId(pub String);

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission(pub String);

impl Permission {
    pub fn parse_list(raw: &str) -> BTreeSet<Permission> {
        raw.split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Permission(value.to_owned()))
            .collect()
    }
}

/// Registration record for a tool capability. Schemas are JSON Schema documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool_id: ToolId,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub required_permissions: BTreeSet<Permission>,
    pub resource_key: Option<String>,
}

impl ToolDescriptor {
    pub fn new(tool_id: impl Into<String>, input_schema: Value) -> Self {
        Self {
            tool_id: ToolId(tool_id.into()),
            description: String::new(),
            input_schema,
            output_schema: None,
            required_permissions: BTreeSet::new(),
            resource_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.insert(Permission(permission.into()));
        self
    }

    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn same_contract(&self, other: &Self) -> bool {
        self.input_schema == other.input_schema
            && self.output_schema == other.output_schema
            && self.required_permissions == other.required_permissions
            && self.resource_key == other.resource_key
    }
}

/// A single tool call issued on behalf of a session.
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_id: ToolId,
    pub arguments: Value,
    pub collection_version: Arc<CollectionVersion>,
    pub requester: SessionId,
    pub granted_permissions: BTreeSet<Permission>,
    pub correlation_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Completed,
    Failed,
    Timeout,
    Rejected,
    Abandoned,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Transcript record of one tool call and how it ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_id: ToolId,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRecord {
    /// Text handed back to the model as the tool message body.
    pub fn model_content(&self) -> String {
        match (&self.output, &self.error) {
            (Some(output), _) => output.to_string(),
            (None, Some(error)) => {
                serde_json::json!({ "status": self.status.as_str(), "error": error }).to_string()
            }
            (None, None) => serde_json::json!({ "status": self.status.as_str() }).to_string(),
        }
    }
}

/// Stable digest of call arguments, logged in place of the raw payload.
pub fn arguments_fingerprint(arguments: &Value) -> String {
    let digest = blake3::hash(arguments.to_string().as_bytes());
    digest.to_hex()[..16].to_owned()
}
