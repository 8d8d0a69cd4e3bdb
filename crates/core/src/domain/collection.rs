use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tool::ToolId;

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.3;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are a helpful assistant that answers questions \
using the provided context.\n\nContext:\n{{ context }}\n\nWhen you use a passage, cite it as \
[Source N]. If the context does not contain the answer, say so plainly.\n\nQuestion: {{ query }}";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub String);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata equality filter applied by the vector index before ranking.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPredicate {
    #[serde(default)]
    pub must_match: BTreeMap<String, String>,
}

impl FilterPredicate {
    pub fn is_empty(&self) -> bool {
        self.must_match.is_empty()
    }

    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.must_match.iter().all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub score_threshold: f32,
    #[serde(default)]
    pub filter: FilterPredicate,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            filter: FilterPredicate::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub embedding_model: String,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Tools offered to the model, in the order they are offered.
    #[serde(default)]
    pub allowed_tools: Vec<ToolId>,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_owned()
}

impl CollectionConfig {
    pub fn new(embedding_model: impl Into<String>) -> Self {
        Self {
            embedding_model: embedding_model.into(),
            retrieval: RetrievalConfig::default(),
            allowed_tools: Vec::new(),
            prompt_template: default_prompt_template(),
        }
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        let tool_id = ToolId(tool_id.into());
        if !self.allowed_tools.contains(&tool_id) {
            self.allowed_tools.push(tool_id);
        }
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.embedding_model.trim().is_empty() {
            return Err("embedding_model must not be empty".to_owned());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be greater than zero".to_owned());
        }
        let threshold = self.retrieval.score_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err("retrieval.score_threshold must be within [0, 1]".to_owned());
        }
        if self.prompt_template.trim().is_empty() {
            return Err("prompt_template must not be empty".to_owned());
        }
        let mut seen = BTreeSet::new();
        for tool_id in &self.allowed_tools {
            if tool_id.0.trim().is_empty() {
                return Err("allowed_tools must not contain an empty tool id".to_owned());
            }
            if !seen.insert(tool_id) {
                return Err(format!("allowed_tools lists `{tool_id}` more than once"));
            }
        }
        Ok(())
    }
}

/// Immutable snapshot of a collection's retrieval and tool policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionVersion {
    pub collection_id: CollectionId,
    pub version_number: u64,
    pub config: CollectionConfig,
    pub published_at: DateTime<Utc>,
}

impl CollectionVersion {
    pub fn allows_tool(&self, tool_id: &ToolId) -> bool {
        self.config.allowed_tools.contains(tool_id)
    }
}
