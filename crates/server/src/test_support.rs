use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use ragway_agent::{
    LanguageModel, ModelError, ModelEvent, ModelEventStream, ModelRequest, OrchestratorDependencies,
    OrchestratorSettings, SessionOrchestrator, Tool, ToolExecutionEngine, ToolFailure,
};
use ragway_core::audit::TracingAuditSink;
use ragway_core::domain::session::MessageRole;
use ragway_core::domain::tool::ToolDescriptor;
use ragway_core::persistence::{InMemoryTranscriptStore, TranscriptStore};
use ragway_core::registry::CollectionRegistry;
use ragway_core::retrieval::{EmbeddingProvider, InMemoryVectorIndex, RetrievalError};
use ragway_db::{
    CollectionVersionRepository, DbPool, InMemoryCollectionVersionRepository, SqlTranscriptStore,
};
use serde_json::{json, Value};

use crate::api::AppState;

/// Answers every turn by echoing the latest user message.
pub struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        let question = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(stream::iter([ModelEvent::TextDelta(format!("you asked: {question}")), ModelEvent::End])
            .boxed())
    }
}

/// Never produces an event; the request only ends through cancellation.
pub struct HangingModel;

#[async_trait]
impl LanguageModel for HangingModel {
    async fn stream_turn(&self, _request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        Ok(stream::pending().boxed())
    }
}

pub struct UnitEmbedder;

#[async_trait]
impl EmbeddingProvider for UnitEmbedder {
    async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(vec![1.0, 0.0])
    }
}

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        )
        .with_description("Returns its input")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        Ok(input)
    }
}

fn orchestrator(
    registry: Arc<CollectionRegistry>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolExecutionEngine>,
    store: Arc<dyn TranscriptStore>,
) -> SessionOrchestrator {
    SessionOrchestrator::new(
        OrchestratorDependencies {
            registry,
            embedder: Arc::new(UnitEmbedder),
            index: Arc::new(InMemoryVectorIndex::new()),
            model,
            tools,
            store,
            audit: Arc::new(TracingAuditSink),
        },
        OrchestratorSettings::default(),
    )
}

fn tools() -> Arc<ToolExecutionEngine> {
    Arc::new(ToolExecutionEngine::new(Duration::from_secs(5), Arc::new(TracingAuditSink)))
}

/// Orchestrator persisting into `pool`, with an empty registry.
pub fn orchestrator_for(pool: DbPool) -> (Arc<CollectionRegistry>, SessionOrchestrator) {
    let registry = Arc::new(CollectionRegistry::new());
    let orchestrator = orchestrator(
        registry.clone(),
        Arc::new(EchoModel),
        tools(),
        Arc::new(SqlTranscriptStore::new(pool)),
    );
    (registry, orchestrator)
}

pub async fn app_state() -> AppState {
    app_state_with_model(EchoModel).await
}

pub async fn app_state_with_model(model: impl LanguageModel + 'static) -> AppState {
    let registry = Arc::new(CollectionRegistry::new());
    let transcripts: Arc<dyn TranscriptStore> = Arc::new(InMemoryTranscriptStore::default());
    let versions: Arc<dyn CollectionVersionRepository> =
        Arc::new(InMemoryCollectionVersionRepository::default());
    let tools = tools();
    let orchestrator =
        orchestrator(registry.clone(), Arc::new(model), tools.clone(), transcripts.clone());
    AppState { orchestrator, registry, versions, transcripts, tools }
}
