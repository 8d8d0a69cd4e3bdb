//! Generation coordinator.
//!
//! Drives one request through `Init -> ContextAssembled -> Generating`,
//! looping through `ToolPending` while the model asks for tools, and ends in
//! `Done` (via `Finalizing`) or `Aborted`. Every state change goes through
//! [`transition`], so an illegal edge is an error instead of a silent jump.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use ragway_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use ragway_core::domain::chunk::{RetrievedChunk, SourceAttribution};
use ragway_core::domain::collection::CollectionVersion;
use ragway_core::domain::session::{Session, SessionStatus};
use ragway_core::domain::tool::{Permission, ToolCallRecord, ToolCallStatus, ToolInvocation};
use ragway_core::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::ContextAssembler;
use crate::llm::{LanguageModel, ModelEvent, ModelRequest, ToolCallRequest};
use crate::stream::{EventEmitter, SessionEvent, UsageSummary};
use crate::tools::ToolExecutionEngine;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Init,
    ContextAssembled,
    Generating,
    ToolPending,
    Finalizing,
    Done,
    Aborted,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationSignal {
    ContextReady,
    TurnStarted,
    ToolCallsRequested,
    ToolResultsInjected,
    TurnCompleted,
    RoundTripLimitReached,
    TurnTimedOut,
    Finalized,
    ModelFailed,
    Cancelled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid generation transition from {from:?} on {signal:?}")]
pub struct GenerationTransitionError {
    pub from: GenerationState,
    pub signal: GenerationSignal,
}

pub fn transition(
    current: GenerationState,
    signal: GenerationSignal,
) -> Result<GenerationState, GenerationTransitionError> {
    use GenerationSignal as S;
    use GenerationState as G;

    let next = match (current, signal) {
        (G::Init, S::ContextReady) => G::ContextAssembled,
        (G::ContextAssembled, S::TurnStarted) => G::Generating,
        (G::Generating, S::ToolCallsRequested) => G::ToolPending,
        (G::ToolPending, S::ToolResultsInjected) => G::Generating,
        (G::Generating, S::TurnCompleted)
        | (G::Generating, S::RoundTripLimitReached)
        | (G::Generating, S::TurnTimedOut) => G::Finalizing,
        (G::Finalizing, S::Finalized) => G::Done,
        (state, S::Cancelled) | (state, S::ModelFailed) if !state.is_terminal() => G::Aborted,
        (from, signal) => return Err(GenerationTransitionError { from, signal }),
    };
    Ok(next)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_tool_round_trips: u32,
    pub turn_timeout: Duration,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self { max_tool_round_trips: 5, turn_timeout: Duration::from_secs(60) }
    }
}

/// Inputs for one generation run over an already-opened session.
pub struct GenerationRequest<'a> {
    pub query: &'a str,
    pub version: Arc<CollectionVersion>,
    pub chunks: Vec<RetrievedChunk>,
    /// Number of session messages that predate this request.
    pub history_len: usize,
    pub granted_permissions: &'a BTreeSet<Permission>,
    pub correlation_id: &'a str,
    pub cancellation: &'a CancellationToken,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutcome {
    pub state: GenerationState,
    pub status: SessionStatus,
    pub usage: UsageSummary,
    pub error: Option<(ErrorKind, String)>,
}

#[derive(Default)]
struct TurnResult {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    ending: TurnEnding,
}

#[derive(Default)]
enum TurnEnding {
    #[default]
    Completed,
    TimedOut,
    Cancelled,
    Failed(ErrorKind, String),
}

struct Run<'a> {
    state: GenerationState,
    usage: UsageSummary,
    error: Option<(ErrorKind, String)>,
    audit: AuditContext,
    emitter: &'a EventEmitter,
}

pub struct GenerationCoordinator {
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolExecutionEngine>,
    assembler: ContextAssembler,
    limits: GenerationLimits,
    audit: Arc<dyn AuditSink>,
}

impl GenerationCoordinator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolExecutionEngine>,
        assembler: ContextAssembler,
        limits: GenerationLimits,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { model, tools, assembler, limits, audit }
    }

    pub fn limits(&self) -> GenerationLimits {
        self.limits
    }

    pub(crate) async fn run(
        &self,
        session: &mut Session,
        request: GenerationRequest<'_>,
        emitter: &EventEmitter,
    ) -> GenerationOutcome {
        let mut run = Run {
            state: GenerationState::Init,
            usage: UsageSummary { degraded: session.degraded, ..UsageSummary::default() },
            error: None,
            audit: AuditContext::new(
                Some(session.session_id.clone()),
                Some(session.collection_id.clone()),
                request.correlation_id,
                "generation-coordinator",
            ),
            emitter,
        };

        if let Err(transition_error) = self.drive(session, &request, &mut run).await {
            error!(
                event_name = "generation.transition.invalid",
                correlation_id = %request.correlation_id,
                session_id = %session.session_id,
                error = %transition_error,
                "generation state machine rejected a transition"
            );
            run.state = GenerationState::Aborted;
            run.error = Some((ErrorKind::Internal, transition_error.to_string()));
        }

        let status = match (&run.state, &run.error) {
            (GenerationState::Done, _) => SessionStatus::Completed,
            (_, Some(_)) => SessionStatus::Failed,
            _ => SessionStatus::Cancelled,
        };
        run.usage.degraded = session.degraded;
        GenerationOutcome { state: run.state, status, usage: run.usage, error: run.error }
    }

    async fn drive(
        &self,
        session: &mut Session,
        request: &GenerationRequest<'_>,
        run: &mut Run<'_>,
    ) -> Result<(), GenerationTransitionError> {
        let history_len = request.history_len.min(session.messages.len());
        let window = self.assembler.assemble(
            request.query,
            &request.version,
            request.chunks.clone(),
            &session.messages[..history_len],
        );
        let sources = SourceAttribution::from_ranked(&window.chunks);
        run.usage.context_tokens = window.estimated_tokens;
        run.usage.source_count = sources.len();
        self.advance(run, GenerationSignal::ContextReady)?;

        if !sources.is_empty() {
            run.emitter.emit(SessionEvent::Sources { sources: sources.clone() }).await;
        }

        let tools = self
            .tools
            .authorized_descriptors(&request.version, request.granted_permissions);
        self.advance(run, GenerationSignal::TurnStarted)?;

        loop {
            if request.cancellation.is_cancelled() {
                return self.advance(run, GenerationSignal::Cancelled);
            }

            run.usage.model_turns += 1;
            let model_request = ModelRequest {
                system_prompt: window.prompt.clone(),
                messages: session.messages[window.history_start..].to_vec(),
                tools: tools.clone(),
                turn: run.usage.model_turns,
            };
            let turn = self.stream_turn(model_request, request.cancellation, run.emitter).await;
            let is_final = turn.tool_calls.is_empty();

            if !turn.text.is_empty() {
                let attached = if is_final { sources.clone() } else { Vec::new() };
                session.append_assistant(turn.text, attached);
            }

            match turn.ending {
                TurnEnding::Completed => {}
                TurnEnding::Cancelled => return self.advance(run, GenerationSignal::Cancelled),
                TurnEnding::Failed(kind, message) => {
                    run.error = Some((kind, message));
                    return self.advance(run, GenerationSignal::ModelFailed);
                }
                TurnEnding::TimedOut => {
                    let reason = format!(
                        "generation turn exceeded its {}ms budget; the answer may be incomplete",
                        self.limits.turn_timeout.as_millis()
                    );
                    self.degrade(session, run, reason).await;
                    self.advance(run, GenerationSignal::TurnTimedOut)?;
                    return self.advance(run, GenerationSignal::Finalized);
                }
            }

            if is_final {
                self.advance(run, GenerationSignal::TurnCompleted)?;
                return self.advance(run, GenerationSignal::Finalized);
            }

            if run.usage.tool_round_trips >= self.limits.max_tool_round_trips {
                for call in turn.tool_calls {
                    let record = ToolCallRecord {
                        call_id: call.call_id,
                        tool_id: call.tool_id,
                        arguments: call.arguments,
                        status: ToolCallStatus::Rejected,
                        output: None,
                        error: Some("tool round-trip limit reached".to_owned()),
                    };
                    self.inject(session, run, record).await;
                }
                let reason = format!(
                    "stopped after {} tool round-trips; the answer may be incomplete",
                    self.limits.max_tool_round_trips
                );
                self.degrade(session, run, reason).await;
                self.advance(run, GenerationSignal::RoundTripLimitReached)?;
                return self.advance(run, GenerationSignal::Finalized);
            }

            self.advance(run, GenerationSignal::ToolCallsRequested)?;
            run.usage.tool_round_trips += 1;
            let records = self.dispatch(turn.tool_calls, session, request).await;
            for record in records {
                self.inject(session, run, record).await;
            }

            if request.cancellation.is_cancelled() {
                return self.advance(run, GenerationSignal::Cancelled);
            }
            self.advance(run, GenerationSignal::ToolResultsInjected)?;
        }
    }

    async fn stream_turn(
        &self,
        request: ModelRequest,
        cancellation: &CancellationToken,
        emitter: &EventEmitter,
    ) -> TurnResult {
        let deadline = Instant::now() + self.limits.turn_timeout;
        let mut result = TurnResult::default();

        let opened = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                result.ending = TurnEnding::Cancelled;
                return result;
            }
            opened = tokio::time::timeout_at(deadline, self.model.stream_turn(request)) => opened,
        };
        let mut events = match opened {
            Err(_) => {
                result.ending = TurnEnding::TimedOut;
                return result;
            }
            Ok(Err(model_error)) => {
                result.ending = TurnEnding::Failed(ErrorKind::ModelError, model_error.to_string());
                return result;
            }
            Ok(Ok(events)) => events,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    result.ending = TurnEnding::Cancelled;
                    return result;
                }
                next = tokio::time::timeout_at(deadline, events.next()) => next,
            };

            match next {
                Err(_) => {
                    result.ending = TurnEnding::TimedOut;
                    return result;
                }
                Ok(None) => {
                    warn!(
                        event_name = "generation.turn.unterminated",
                        "model stream ended without an end marker"
                    );
                    return result;
                }
                Ok(Some(ModelEvent::TextDelta(text))) => {
                    result.text.push_str(&text);
                    if !emitter.emit(SessionEvent::TextDelta { text }).await {
                        result.ending = TurnEnding::Cancelled;
                        return result;
                    }
                }
                Ok(Some(ModelEvent::ToolCallRequest(call))) => {
                    let event = SessionEvent::ToolCallRequest {
                        call_id: call.call_id.clone(),
                        tool_id: call.tool_id.clone(),
                        arguments: call.arguments.clone(),
                    };
                    result.tool_calls.push(call);
                    if !emitter.emit(event).await {
                        result.ending = TurnEnding::Cancelled;
                        return result;
                    }
                }
                Ok(Some(ModelEvent::Error { kind, message })) => {
                    result.ending = TurnEnding::Failed(kind, message);
                    return result;
                }
                Ok(Some(ModelEvent::End)) => return result,
            }
        }
    }

    /// Runs every requested call concurrently; results keep request order.
    async fn dispatch(
        &self,
        calls: Vec<ToolCallRequest>,
        session: &Session,
        request: &GenerationRequest<'_>,
    ) -> Vec<ToolCallRecord> {
        let executions = calls.iter().map(|call| {
            let invocation = ToolInvocation {
                call_id: call.call_id.clone(),
                tool_id: call.tool_id.clone(),
                arguments: call.arguments.clone(),
                collection_version: request.version.clone(),
                requester: session.session_id.clone(),
                granted_permissions: request.granted_permissions.clone(),
                correlation_id: request.correlation_id.to_owned(),
            };
            self.tools.execute(invocation, request.cancellation)
        });
        let results = join_all(executions).await;

        calls
            .into_iter()
            .zip(results)
            .map(|(call, result)| match result {
                Ok(output) => ToolCallRecord {
                    call_id: call.call_id,
                    tool_id: call.tool_id,
                    arguments: call.arguments,
                    status: ToolCallStatus::Completed,
                    output: Some(output),
                    error: None,
                },
                Err(tool_error) => ToolCallRecord {
                    call_id: call.call_id,
                    tool_id: call.tool_id,
                    arguments: call.arguments,
                    status: tool_error.call_status(),
                    output: None,
                    error: Some(tool_error.to_string()),
                },
            })
            .collect()
    }

    async fn inject(&self, session: &mut Session, run: &Run<'_>, record: ToolCallRecord) {
        let event = SessionEvent::ToolResult {
            call_id: record.call_id.clone(),
            tool_id: record.tool_id.clone(),
            status: record.status,
            output: record.output.clone(),
            error: record.error.clone(),
        };
        session.append_tool_result(record);
        run.emitter.emit(event).await;
    }

    async fn degrade(&self, session: &mut Session, run: &mut Run<'_>, reason: String) {
        session.degraded = true;
        run.usage.degraded = true;
        self.audit.emit(
            run.audit
                .event("generation.degraded", AuditCategory::Generation, AuditOutcome::Degraded)
                .with_metadata("reason", reason.clone()),
        );
        run.emitter.emit(SessionEvent::Degraded { reason }).await;
    }

    fn advance(
        &self,
        run: &mut Run<'_>,
        signal: GenerationSignal,
    ) -> Result<(), GenerationTransitionError> {
        let from = run.state;
        let to = transition(from, signal)?;
        run.state = to;

        debug!(
            event_name = "generation.transition",
            correlation_id = %run.audit.correlation_id,
            from = ?from,
            to = ?to,
            signal = ?signal,
            "generation state advanced"
        );
        if to.is_terminal() {
            let outcome = match to {
                GenerationState::Done => AuditOutcome::Success,
                _ if run.error.is_some() => AuditOutcome::Failed,
                _ => AuditOutcome::Abandoned,
            };
            self.audit.emit(
                run.audit
                    .event("generation.finished", AuditCategory::Generation, outcome)
                    .with_metadata("from", format!("{from:?}"))
                    .with_metadata("signal", format!("{signal:?}"))
                    .with_metadata("model_turns", run.usage.model_turns.to_string())
                    .with_metadata("tool_round_trips", run.usage.tool_round_trips.to_string()),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{transition, GenerationSignal as S, GenerationState as G};

    #[test]
    fn happy_path_without_tools() {
        let mut state = G::Init;
        for signal in [S::ContextReady, S::TurnStarted, S::TurnCompleted, S::Finalized] {
            state = transition(state, signal).expect("legal transition");
        }
        assert_eq!(state, G::Done);
    }

    #[test]
    fn tool_loop_returns_to_generating() {
        let state = transition(G::Generating, S::ToolCallsRequested).expect("request tools");
        assert_eq!(state, G::ToolPending);
        assert_eq!(transition(state, S::ToolResultsInjected), Ok(G::Generating));
    }

    #[test]
    fn limits_and_timeouts_finalize_rather_than_abort() {
        assert_eq!(transition(G::Generating, S::RoundTripLimitReached), Ok(G::Finalizing));
        assert_eq!(transition(G::Generating, S::TurnTimedOut), Ok(G::Finalizing));
    }

    #[test]
    fn cancellation_aborts_from_any_live_state() {
        for state in [G::Init, G::ContextAssembled, G::Generating, G::ToolPending, G::Finalizing] {
            assert_eq!(transition(state, S::Cancelled), Ok(G::Aborted));
        }
    }

    #[test]
    fn terminal_states_reject_further_signals() {
        assert!(transition(G::Done, S::Cancelled).is_err());
        assert!(transition(G::Aborted, S::TurnStarted).is_err());
        assert!(transition(G::ToolPending, S::TurnCompleted).is_err());
    }
}
