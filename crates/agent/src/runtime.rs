//! Session orchestrator: the entry point for a query.
//!
//! `handle` validates the request, claims the session, pins a collection
//! version, and hands back an event stream while the work runs on its own
//! task. Whatever happens after the stream is returned, the transcript is
//! persisted exactly once per request.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ragway_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use ragway_core::config::OrchestrationConfig;
use ragway_core::domain::collection::{CollectionId, CollectionVersion};
use ragway_core::domain::session::{Session, SessionId, SessionStatus};
use ragway_core::domain::tool::Permission;
use ragway_core::errors::{ApplicationError, ErrorKind};
use ragway_core::persistence::{PersistenceError, TranscriptStore};
use ragway_core::registry::{CollectionRegistry, RegistryError};
use ragway_core::retrieval::{
    ContextRetriever, EmbeddingProvider, RetrievalPolicy, VectorIndex,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ContextAssembler;
use crate::generation::{
    GenerationCoordinator, GenerationLimits, GenerationOutcome, GenerationRequest,
    GenerationState,
};
use crate::llm::LanguageModel;
use crate::stream::{EventEmitter, EventStream, SessionEvent, UsageSummary};
use crate::tools::ToolExecutionEngine;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session `{0}` already has a request in flight")]
    SessionBusy(SessionId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::SessionBusy(_) => ErrorKind::SessionBusy,
            Self::Registry(RegistryError::NotFound(_))
            | Self::Registry(RegistryError::VersionNotFound { .. }) => ErrorKind::NotFound,
            Self::Registry(_) => ErrorKind::InvalidRequest,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

impl From<OrchestrationError> for ApplicationError {
    fn from(value: OrchestrationError) -> Self {
        match value {
            OrchestrationError::InvalidRequest(message) => ApplicationError::InvalidRequest(message),
            OrchestrationError::SessionBusy(session_id) => {
                ApplicationError::SessionBusy(session_id.0)
            }
            OrchestrationError::Registry(error) => error.into(),
            OrchestrationError::Persistence(error) => error.into(),
        }
    }
}

/// Caller identity and controls for one request.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: String,
    pub granted_permissions: BTreeSet<Permission>,
    pub correlation_id: String,
    pub cancellation: CancellationToken,
}

impl SessionContext {
    pub fn new(session_id: SessionId, user_id: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            granted_permissions: BTreeSet::new(),
            correlation_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.granted_permissions.extend(permissions);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retrieval: RetrievalPolicy,
    pub limits: GenerationLimits,
    pub context_token_limit: usize,
    pub event_buffer: usize,
    pub persist_retry_backoff: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestrationConfig::default())
    }
}

impl From<&OrchestrationConfig> for OrchestratorSettings {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            retrieval: RetrievalPolicy {
                timeout: config.retrieval_timeout(),
                retry_backoff: config.retrieval_retry_backoff(),
            },
            limits: GenerationLimits {
                max_tool_round_trips: config.max_tool_round_trips,
                turn_timeout: config.generation_turn_timeout(),
            },
            context_token_limit: config.context_token_limit,
            event_buffer: config.event_buffer,
            persist_retry_backoff: config.persist_retry_backoff(),
        }
    }
}

pub struct OrchestratorDependencies {
    pub registry: Arc<CollectionRegistry>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub index: Arc<dyn VectorIndex>,
    pub model: Arc<dyn LanguageModel>,
    pub tools: Arc<ToolExecutionEngine>,
    pub store: Arc<dyn TranscriptStore>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<CollectionRegistry>,
    retriever: ContextRetriever,
    coordinator: GenerationCoordinator,
    store: Arc<dyn TranscriptStore>,
    audit: Arc<dyn AuditSink>,
    settings: OrchestratorSettings,
    active: Mutex<HashMap<SessionId, CancellationToken>>,
}

struct OpenedRequest {
    session: Session,
    version: Arc<CollectionVersion>,
    history_len: usize,
}

impl SessionOrchestrator {
    pub fn new(dependencies: OrchestratorDependencies, settings: OrchestratorSettings) -> Self {
        let retriever =
            ContextRetriever::new(dependencies.embedder, dependencies.index, settings.retrieval);
        let coordinator = GenerationCoordinator::new(
            dependencies.model,
            dependencies.tools,
            ContextAssembler::new(settings.context_token_limit),
            settings.limits,
            dependencies.audit.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                registry: dependencies.registry,
                retriever,
                coordinator,
                store: dependencies.store,
                audit: dependencies.audit,
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts a request and returns its event stream. Requests that cannot
    /// start (empty query, unknown collection, busy session) fail here
    /// instead of producing a stream.
    pub async fn handle(
        &self,
        query: &str,
        collection_id: &CollectionId,
        context: SessionContext,
    ) -> Result<EventStream, OrchestrationError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(OrchestrationError::InvalidRequest("query must not be empty".to_owned()));
        }

        let claim = ActiveSession::claim(self.inner.clone(), &context)?;
        let opened = self.open(query, collection_id, &context).await?;
        let (emitter, stream) = EventEmitter::channel(
            self.inner.settings.event_buffer,
            context.cancellation.clone(),
            self.inner.settings.limits.turn_timeout,
        );

        info!(
            event_name = "session.request.accepted",
            correlation_id = %context.correlation_id,
            session_id = %context.session_id,
            collection_id = %collection_id,
            collection_version = opened.version.version_number,
            "accepted query"
        );

        let inner = self.inner.clone();
        let query = query.to_owned();
        tokio::spawn(async move {
            inner.run(query, opened, context, emitter, claim).await;
        });
        Ok(stream)
    }

    /// Trips the cancellation signal of an in-flight request.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.inner.active().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Trips every in-flight request. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let active = self.inner.active();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.inner.active().contains_key(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active().len()
    }

    async fn open(
        &self,
        query: &str,
        collection_id: &CollectionId,
        context: &SessionContext,
    ) -> Result<OpenedRequest, OrchestrationError> {
        let prior = self.inner.store.load_session(&context.session_id).await?;
        let (mut session, version) = match prior {
            Some(prior) => {
                if &prior.collection_id != collection_id {
                    return Err(OrchestrationError::InvalidRequest(format!(
                        "session `{}` is bound to collection `{}`",
                        prior.session_id, prior.collection_id
                    )));
                }
                if prior.user_id != context.user_id {
                    return Err(OrchestrationError::InvalidRequest(format!(
                        "session `{}` belongs to another user",
                        prior.session_id
                    )));
                }
                let version =
                    self.inner.registry.version(collection_id, prior.collection_version)?;
                (prior.resume(), version)
            }
            None => {
                let version = self.inner.registry.resolve(collection_id)?;
                let session =
                    Session::start(context.session_id.clone(), context.user_id.clone(), &version);
                (session, version)
            }
        };

        let history_len = session.messages.len();
        session.append_user(query);
        Ok(OpenedRequest { session, version, history_len })
    }
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<SessionId, CancellationToken>> {
        match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run(
        self: Arc<Self>,
        query: String,
        opened: OpenedRequest,
        context: SessionContext,
        emitter: EventEmitter,
        claim: ActiveSession,
    ) {
        let OpenedRequest { session, version, history_len } = opened;
        let audit = AuditContext::new(
            Some(session.session_id.clone()),
            Some(session.collection_id.clone()),
            context.correlation_id.clone(),
            "session-orchestrator",
        );
        self.audit.emit(
            audit
                .event("session.started", AuditCategory::Session, AuditOutcome::Success)
                .with_metadata("collection_version", version.version_number.to_string())
                .with_metadata("history_len", history_len.to_string()),
        );

        let mut transcript = TranscriptGuard::new(self.clone(), session);
        emitter
            .emit(SessionEvent::SessionStarted {
                session_id: context.session_id.clone(),
                collection_id: version.collection_id.clone(),
                collection_version: version.version_number,
            })
            .await;

        let retrieval = tokio::select! {
            biased;
            _ = context.cancellation.cancelled() => None,
            outcome = self.retriever.fetch(&query, &version) => Some(outcome),
        };

        let outcome = match retrieval {
            None => GenerationOutcome {
                state: GenerationState::Aborted,
                status: SessionStatus::Cancelled,
                usage: UsageSummary::default(),
                error: None,
            },
            Some(retrieval) => {
                if let Some(retrieval_error) = &retrieval.degraded {
                    transcript.session_mut().degraded = true;
                    self.audit.emit(
                        audit
                            .event(
                                "retrieval.degraded",
                                AuditCategory::Retrieval,
                                AuditOutcome::Degraded,
                            )
                            .with_metadata("error_kind", retrieval_error.kind().as_str())
                            .with_metadata("attempts", retrieval.attempts.to_string()),
                    );
                    emitter
                        .emit(SessionEvent::Degraded {
                            reason: format!(
                                "retrieval unavailable, answering without context: {retrieval_error}"
                            ),
                        })
                        .await;
                }

                let request = GenerationRequest {
                    query: &query,
                    version: version.clone(),
                    chunks: retrieval.chunks,
                    history_len,
                    granted_permissions: &context.granted_permissions,
                    correlation_id: &context.correlation_id,
                    cancellation: &context.cancellation,
                };
                self.coordinator.run(transcript.session_mut(), request, &emitter).await
            }
        };

        let persisted = transcript.finish(outcome.status).await;
        drop(claim);

        let terminal = match (&persisted, &outcome.error) {
            (Err(persist_error), _) => SessionEvent::Error {
                kind: ErrorKind::Persistence,
                message: format!("transcript could not be saved: {persist_error}"),
            },
            (Ok(()), Some((kind, message))) => {
                SessionEvent::Error { kind: *kind, message: message.clone() }
            }
            (Ok(()), None) if outcome.status == SessionStatus::Cancelled => SessionEvent::Error {
                kind: ErrorKind::Aborted,
                message: "request was cancelled".to_owned(),
            },
            (Ok(()), None) => SessionEvent::End { status: outcome.status, usage: outcome.usage.clone() },
        };

        let audit_outcome = match (&persisted, outcome.status) {
            (Err(_), _) => AuditOutcome::Failed,
            (Ok(()), SessionStatus::Completed) if outcome.usage.degraded => AuditOutcome::Degraded,
            (Ok(()), SessionStatus::Completed) => AuditOutcome::Success,
            (Ok(()), SessionStatus::Cancelled) => AuditOutcome::Abandoned,
            (Ok(()), _) => AuditOutcome::Failed,
        };
        self.audit.emit(
            audit
                .event("session.finalized", AuditCategory::Session, audit_outcome)
                .with_metadata("status", outcome.status.as_str())
                .with_metadata("terminal_event", terminal.name())
                .with_metadata("model_turns", outcome.usage.model_turns.to_string())
                .with_metadata("tool_round_trips", outcome.usage.tool_round_trips.to_string()),
        );
        info!(
            event_name = "session.request.finished",
            correlation_id = %context.correlation_id,
            session_id = %context.session_id,
            status = outcome.status.as_str(),
            terminal_event = terminal.name(),
            "request finished"
        );

        emitter.emit(terminal).await;
    }

    /// Appends the transcript, retrying once after a short backoff. The
    /// store's append is idempotent, so a retry after a partial write is safe.
    async fn persist(&self, session: &Session) -> Result<(), PersistenceError> {
        let first = match self.store.append_session(session).await {
            Ok(()) => return Ok(()),
            Err(first) => first,
        };
        warn!(
            event_name = "session.persist.retry",
            session_id = %session.session_id,
            error = %first,
            "transcript append failed, retrying once"
        );
        tokio::time::sleep(self.settings.persist_retry_backoff).await;

        self.store.append_session(session).await.map_err(|second| {
            error!(
                event_name = "session.persist.failed",
                session_id = %session.session_id,
                error = %second,
                "transcript append failed after retry"
            );
            self.audit.emit(
                AuditContext::new(
                    Some(session.session_id.clone()),
                    Some(session.collection_id.clone()),
                    "unassigned",
                    "session-orchestrator",
                )
                .event("session.persist_failed", AuditCategory::Persistence, AuditOutcome::Failed)
                .with_metadata("error", second.to_string()),
            );
            second
        })
    }
}

/// Marks a session as having a request in flight until dropped.
struct ActiveSession {
    inner: Arc<Inner>,
    session_id: SessionId,
}

impl ActiveSession {
    fn claim(inner: Arc<Inner>, context: &SessionContext) -> Result<Self, OrchestrationError> {
        {
            let mut active = inner.active();
            if active.contains_key(&context.session_id) {
                return Err(OrchestrationError::SessionBusy(context.session_id.clone()));
            }
            active.insert(context.session_id.clone(), context.cancellation.clone());
        }
        Ok(Self { inner, session_id: context.session_id.clone() })
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.inner.active().remove(&self.session_id);
    }
}

/// Owns the in-flight transcript. `finish` persists it; if the request task
/// dies before that, dropping the guard persists what exists as failed.
struct TranscriptGuard {
    inner: Arc<Inner>,
    session: Session,
    finished: bool,
}

impl TranscriptGuard {
    fn new(inner: Arc<Inner>, session: Session) -> Self {
        Self { inner, session, finished: false }
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    async fn finish(&mut self, status: SessionStatus) -> Result<(), PersistenceError> {
        self.finished = true;
        self.session.finish(status);
        self.inner.persist(&self.session).await
    }
}

impl Drop for TranscriptGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut session = self.session.clone();
        session.finish(SessionStatus::Failed);
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    event_name = "session.persist.abandoned_request",
                    session_id = %session.session_id,
                    "request ended without finalizing, saving partial transcript"
                );
                handle.spawn(async move {
                    if let Err(persist_error) = inner.persist(&session).await {
                        warn!(
                            event_name = "session.persist.partial_lost",
                            session_id = %session.session_id,
                            error = %persist_error,
                            "partial transcript of an abandoned request was not saved"
                        );
                    }
                });
            }
            Err(_) => error!(
                event_name = "session.persist.no_runtime",
                session_id = %session.session_id,
                "partial transcript dropped without a runtime to persist it"
            ),
        }
    }
}
