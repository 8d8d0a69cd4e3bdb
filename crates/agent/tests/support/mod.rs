#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ragway_agent::{
    LanguageModel, ModelError, ModelEvent, ModelEventStream, ModelRequest, OrchestratorDependencies,
    OrchestratorSettings, SessionEvent, SessionOrchestrator, Tool, ToolCallRequest,
    ToolExecutionEngine, ToolFailure,
};
use ragway_agent::EventStream;
use ragway_core::audit::InMemoryAuditSink;
use ragway_core::domain::collection::{CollectionConfig, CollectionId, FilterPredicate};
use ragway_core::domain::session::{Session, SessionId};
use ragway_core::domain::tool::{ToolDescriptor, ToolId};
use ragway_core::persistence::{InMemoryTranscriptStore, PersistenceError, TranscriptStore};
use ragway_core::registry::CollectionRegistry;
use ragway_core::retrieval::memory::IndexedChunk;
use ragway_core::retrieval::{
    EmbeddingProvider, IndexMatch, InMemoryVectorIndex, RetrievalError, VectorIndex,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

pub const COLLECTION: &str = "handbook";

type Script = dyn Fn(&ModelRequest) -> Result<ModelEventStream, ModelError> + Send + Sync;

/// Model double driven by a closure over the incoming request.
pub struct ScriptedModel {
    script: Box<Script>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ModelRequest) -> Result<ModelEventStream, ModelError> + Send + Sync + 'static,
    {
        Self { script: Box::new(script), requests: Mutex::new(Vec::new()) }
    }

    /// Answers every turn with the same text.
    pub fn answering(text: &'static str) -> Self {
        Self::new(move |_| Ok(events(vec![ModelEvent::TextDelta(text.to_owned()), ModelEvent::End])))
    }

    /// First turn requests one tool call, later turns answer.
    pub fn calling_once(tool: &'static str, arguments: Value) -> Self {
        Self::new(move |request| {
            if request.turn == 1 {
                Ok(events(vec![tool_call("call-1", tool, arguments.clone()), ModelEvent::End]))
            } else {
                Ok(events(vec![ModelEvent::TextDelta("done".to_owned()), ModelEvent::End]))
            }
        })
    }

    /// A turn that never produces an event.
    pub fn hanging() -> Self {
        Self::new(|_| Ok(stream::pending().boxed()))
    }

    /// An endless, slow trickle of text.
    pub fn dripping() -> Self {
        Self::new(|_| {
            Ok(stream::unfold((), |()| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some((ModelEvent::TextDelta(".".to_owned()), ()))
            })
            .boxed())
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelEventStream, ModelError> {
        let result = (self.script)(&request);
        self.requests.lock().expect("requests lock").push(request);
        result
    }
}

pub fn events(items: Vec<ModelEvent>) -> ModelEventStream {
    stream::iter(items).boxed()
}

pub fn tool_call(call_id: &str, tool: &str, arguments: Value) -> ModelEvent {
    ModelEvent::ToolCallRequest(ToolCallRequest {
        call_id: call_id.to_owned(),
        tool_id: ToolId(tool.to_owned()),
        arguments,
    })
}

pub struct FixedEmbedder;

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(vec![1.0, 0.0])
    }
}

/// Fails the first `failures` searches, then delegates.
pub struct FlakyIndex {
    inner: InMemoryVectorIndex,
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyIndex {
    pub async fn seeded(failures: usize) -> Self {
        let inner = InMemoryVectorIndex::new();
        for (offset, text) in ["Refunds are issued within 14 days.", "Returns need a receipt."]
            .into_iter()
            .enumerate()
        {
            inner
                .upsert(
                    CollectionId(COLLECTION.to_owned()),
                    IndexedChunk {
                        document_id: "policy.md".to_owned(),
                        offset: offset as u64 * 100,
                        text: text.to_owned(),
                        embedding: vec![1.0, 0.0],
                        metadata: Default::default(),
                    },
                )
                .await;
        }
        Self { inner, failures, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn search(
        &self,
        collection_id: &CollectionId,
        vector: &[f32],
        filter: &FilterPredicate,
        limit: usize,
    ) -> Result<Vec<IndexMatch>, RetrievalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RetrievalError::IndexUnavailable("index offline".to_owned()));
        }
        self.inner.search(collection_id, vector, filter, limit).await
    }
}

/// Counts calls and echoes its input.
pub struct CountingTool {
    descriptor: ToolDescriptor,
    pub calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn lookup() -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                "lookup",
                json!({
                    "type": "object",
                    "properties": {"order_id": {"type": "string"}},
                    "required": ["order_id"]
                }),
            )
            .with_description("Look up an order"),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_descriptor(descriptor: ToolDescriptor) -> Self {
        Self { descriptor, calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"order": input, "state": "shipped"}))
    }
}

/// Signals when it starts, then never finishes on its own.
pub struct StuckTool {
    pub started: Arc<Notify>,
}

#[async_trait]
impl Tool for StuckTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("slow_report", json!({"type": "object"}))
    }

    async fn execute(&self, _input: Value) -> Result<Value, ToolFailure> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

/// Overlap counters shared by several `SlowTool`s.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub finished: AtomicUsize,
}

/// Takes `delay` to answer and records how many calls overlap.
pub struct SlowTool {
    name: &'static str,
    delay: Duration,
    gauge: Arc<InFlight>,
}

impl SlowTool {
    pub fn new(name: &'static str, delay: Duration, gauge: Arc<InFlight>) -> Self {
        Self { name, delay, gauge }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(self.name, json!({"type": "object"}))
    }

    async fn execute(&self, _input: Value) -> Result<Value, ToolFailure> {
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        self.gauge.finished.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"tool": self.name}))
    }
}

/// Brings down the request task that calls it.
pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("explode", json!({"type": "object"}))
    }

    async fn execute(&self, _input: Value) -> Result<Value, ToolFailure> {
        panic!("tool handler crashed");
    }
}

/// Fails the first `failures` appends, then delegates to memory.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryTranscriptStore,
    failures: usize,
    pub appends: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self { failures, ..Self::default() }
    }
}

#[async_trait]
impl TranscriptStore for FlakyStore {
    async fn append_session(&self, session: &Session) -> Result<(), PersistenceError> {
        let attempt = self.appends.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(PersistenceError::Unavailable("disk full".to_owned()));
        }
        self.inner.append_session(session).await
    }

    async fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Session>, PersistenceError> {
        self.inner.load_session(session_id).await
    }
}

pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub registry: Arc<CollectionRegistry>,
    pub model: Arc<ScriptedModel>,
    pub index: Arc<FlakyIndex>,
    pub tools: Arc<ToolExecutionEngine>,
    pub store: Arc<FlakyStore>,
    pub audit: InMemoryAuditSink,
}

pub struct HarnessBuilder {
    model: ScriptedModel,
    index_failures: usize,
    store_failures: usize,
    config: CollectionConfig,
    settings: OrchestratorSettings,
    registry: Arc<CollectionRegistry>,
}

impl HarnessBuilder {
    pub fn new(model: ScriptedModel) -> Self {
        let mut settings = OrchestratorSettings::default();
        settings.retrieval.retry_backoff = Duration::from_millis(5);
        settings.persist_retry_backoff = Duration::from_millis(5);
        Self {
            model,
            index_failures: 0,
            store_failures: 0,
            config: CollectionConfig::new("nomic-embed-text").with_tool("lookup"),
            settings,
            registry: Arc::new(CollectionRegistry::new()),
        }
    }

    pub fn registry(mut self, registry: Arc<CollectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn index_failures(mut self, failures: usize) -> Self {
        self.index_failures = failures;
        self
    }

    pub fn store_failures(mut self, failures: usize) -> Self {
        self.store_failures = failures;
        self
    }

    pub fn settings(mut self, update: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        update(&mut self.settings);
        self
    }

    pub async fn build(self) -> Harness {
        self.registry
            .publish(CollectionId(COLLECTION.to_owned()), self.config)
            .expect("publish collection");

        let audit = InMemoryAuditSink::default();
        let model = Arc::new(self.model);
        let index = Arc::new(FlakyIndex::seeded(self.index_failures).await);
        let store = Arc::new(FlakyStore::failing(self.store_failures));
        let tools = Arc::new(ToolExecutionEngine::new(
            Duration::from_secs(30),
            Arc::new(audit.clone()),
        ));

        let orchestrator = SessionOrchestrator::new(
            OrchestratorDependencies {
                registry: self.registry.clone(),
                embedder: Arc::new(FixedEmbedder),
                index: index.clone(),
                model: model.clone(),
                tools: tools.clone(),
                store: store.clone(),
                audit: Arc::new(audit.clone()),
            },
            self.settings,
        );

        Harness { orchestrator, registry: self.registry, model, index, tools, store, audit }
    }
}

pub async fn collect(mut stream: EventStream) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), stream.next_event())
        .await
        .expect("event stream stalled")
    {
        collected.push(event);
    }
    collected
}

pub fn names(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::name).collect()
}

/// Waits for the session to be released, then for its transcript.
pub async fn released_transcript(harness: &Harness, session_id: &SessionId) -> Session {
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.orchestrator.is_active(session_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("request wound down");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = harness.store.load_session(session_id).await.expect("load") {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transcript persisted")
}
