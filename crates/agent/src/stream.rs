use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use ragway_core::domain::chunk::SourceAttribution;
use ragway_core::domain::collection::CollectionId;
use ragway_core::domain::session::{SessionId, SessionStatus};
use ragway_core::domain::tool::{ToolCallStatus, ToolId};
use ragway_core::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub model_turns: u32,
    pub tool_round_trips: u32,
    pub context_tokens: usize,
    pub source_count: usize,
    pub degraded: bool,
}

/// Client-facing events of one request, in emission order. Exactly one
/// terminal event (`End` or `Error`) closes the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: SessionId,
        collection_id: CollectionId,
        collection_version: u64,
    },
    Degraded {
        reason: String,
    },
    Sources {
        sources: Vec<SourceAttribution>,
    },
    TextDelta {
        text: String,
    },
    ToolCallRequest {
        call_id: String,
        tool_id: ToolId,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        tool_id: ToolId,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    End {
        status: SessionStatus,
        usage: UsageSummary,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::Degraded { .. } => "degraded",
            Self::Sources { .. } => "sources",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCallRequest { .. } => "tool_call_request",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

pub struct EventStream {
    receiver: mpsc::Receiver<SessionEvent>,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.receiver.recv().await
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Producer side of an `EventStream`. A closed receiver means the client
/// went away, and a receiver that accepts nothing for `stall_timeout` is
/// treated the same. Either way the session is cancelled.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    sender: mpsc::Sender<SessionEvent>,
    cancellation: CancellationToken,
    stall_timeout: Duration,
}

impl EventEmitter {
    pub(crate) fn channel(
        buffer: usize,
        cancellation: CancellationToken,
        stall_timeout: Duration,
    ) -> (Self, EventStream) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender, cancellation, stall_timeout }, EventStream { receiver })
    }

    /// Returns `false` once the event cannot reach the client. Never waits
    /// past cancellation or the stall timeout for buffer space.
    pub(crate) async fn emit(&self, event: SessionEvent) -> bool {
        let name = event.name();
        let sent = tokio::select! {
            biased;
            sent = self.sender.send(event) => sent.is_ok(),
            _ = self.cancellation.cancelled() => return false,
            _ = tokio::time::sleep(self.stall_timeout) => {
                warn!(
                    event_name = "session.client.stalled",
                    dropped_event = name,
                    stall_timeout_ms = self.stall_timeout.as_millis() as u64,
                    "client stopped reading events"
                );
                self.cancellation.cancel();
                return false;
            }
        };
        if sent {
            return true;
        }
        if !self.cancellation.is_cancelled() {
            debug!(event_name = "session.client.disconnected", dropped_event = name, "client went away");
            self.cancellation.cancel();
        }
        false
    }
}
