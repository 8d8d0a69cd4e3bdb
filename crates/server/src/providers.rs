//! OpenAI-compatible HTTP adapters for the model and embedding seams.
//!
//! Both OpenAI and Ollama expose `/v1/chat/completions` and `/v1/embeddings`,
//! so one wire format covers both providers.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ragway_agent::{
    LanguageModel, ModelError, ModelEvent, ModelEventStream, ModelRequest, ToolCallRequest,
};
use ragway_core::config::{EmbeddingConfig, LlmConfig, LlmProvider};
use ragway_core::domain::session::{Message, MessageRole};
use ragway_core::domain::tool::{ToolDescriptor, ToolId};
use ragway_core::retrieval::{EmbeddingProvider, RetrievalError};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub(crate) fn build_client(timeout_secs: u64) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(Duration::from_secs(timeout_secs.max(1))).build()
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

pub struct HttpChatModel {
    client: Client,
    url: String,
    model: String,
    api_key: Option<SecretString>,
    max_retries: u32,
}

impl HttpChatModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.provider {
                LlmProvider::OpenAi => OPENAI_BASE_URL,
                LlmProvider::Ollama => OLLAMA_BASE_URL,
            }
            .to_owned()
        });
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: endpoint(&base_url, "/v1/chat/completions"),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn complete(&self, body: &Value) -> Result<ChatCompletion, ModelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.post(&self.url).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key.expose_secret());
            }

            let retryable = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.json::<ChatCompletion>().await.map_err(|error| {
                        ModelError::Protocol(format!("could not decode completion: {error}"))
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    let error = ModelError::Unavailable(format!("model endpoint returned {status}"));
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    error
                }
                Err(error) => ModelError::Unavailable(format!("model request failed: {error}")),
            };

            if attempt > self.max_retries {
                return Err(retryable);
            }
            warn!(
                event_name = "provider.chat.retry",
                attempt,
                error = %retryable,
                "chat completion failed, retrying"
            );
            tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl LanguageModel for HttpChatModel {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        let body = completion_body(&self.model, &request);
        let completion = self.complete(&body).await?;
        let events = completion_events(completion)?;
        debug!(
            event_name = "provider.chat.completed",
            turn = request.turn,
            event_count = events.len(),
            "chat completion received"
        );
        Ok(stream::iter(events).boxed())
    }
}

pub struct HttpEmbeddingProvider {
    client: Client,
    url: String,
    api_key: Option<SecretString>,
}

impl HttpEmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: endpoint(&config.base_url, "/v1/embeddings"),
            api_key: config.api_key.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut request = self.client.post(&self.url).json(&json!({"model": model, "input": text}));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|error| RetrievalError::EmbeddingUnavailable(error.to_string()))?;
        if !response.status().is_success() {
            return Err(RetrievalError::EmbeddingUnavailable(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }
        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| RetrievalError::EmbeddingUnavailable(error.to_string()))?;
        payload
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .filter(|embedding| !embedding.is_empty())
            .ok_or_else(|| RetrievalError::EmbeddingUnavailable("empty embedding".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn completion_body(model: &str, request: &ModelRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": wire_messages(&request.system_prompt, &request.messages),
        "stream": false,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(wire_tool).collect());
    }
    body
}

fn wire_tool(descriptor: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": descriptor.tool_id.0,
            "description": descriptor.description,
            "parameters": descriptor.input_schema,
        }
    })
}

/// Tool results are stored as standalone messages; the wire format wants
/// them preceded by the assistant message that requested them.
fn wire_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
    let mut wire = vec![json!({"role": "system", "content": system_prompt})];
    let mut pending_results: Vec<Value> = Vec::new();

    for message in messages {
        if message.role != MessageRole::Tool {
            wire.append(&mut pending_results);
        }
        match message.role {
            MessageRole::User => wire.push(json!({"role": "user", "content": message.content})),
            MessageRole::Assistant => {
                wire.push(json!({"role": "assistant", "content": message.content}))
            }
            MessageRole::Tool => {
                let Some(record) = &message.tool_call else {
                    continue;
                };
                let call = json!({
                    "id": record.call_id,
                    "type": "function",
                    "function": {
                        "name": record.tool_id.0,
                        "arguments": record.arguments.to_string(),
                    }
                });
                let attach = !pending_results.is_empty()
                    || wire.last().is_some_and(|last| {
                        last["role"] == "assistant" && last.get("tool_calls").is_none()
                    });
                if !attach {
                    wire.push(json!({"role": "assistant", "content": Value::Null}));
                }
                if let Some(assistant) = wire.last_mut() {
                    if assistant.get("tool_calls").is_none() {
                        assistant["tool_calls"] = json!([]);
                    }
                    if let Some(calls) = assistant["tool_calls"].as_array_mut() {
                        calls.push(call);
                    }
                }
                pending_results.push(json!({
                    "role": "tool",
                    "tool_call_id": record.call_id,
                    "content": message.content,
                }));
            }
        }
    }
    wire.append(&mut pending_results);
    wire
}

fn completion_events(completion: ChatCompletion) -> Result<Vec<ModelEvent>, ModelError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Protocol("completion has no choices".to_owned()))?;

    let mut events = Vec::new();
    if let Some(content) = choice.message.content.filter(|content| !content.is_empty()) {
        events.push(ModelEvent::TextDelta(content));
    }
    for call in choice.message.tool_calls {
        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments))
        };
        events.push(ModelEvent::ToolCallRequest(ToolCallRequest {
            call_id: call.id,
            tool_id: ToolId(call.function.name),
            arguments,
        }));
    }
    events.push(ModelEvent::End);
    Ok(events)
}
