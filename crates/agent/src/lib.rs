//! Agent runtime - query orchestration on top of `ragway-core`
//!
//! This crate turns a user query into a streamed, grounded answer:
//! - Pins a collection version for the whole request
//! - Retrieves context and assembles a prompt within a token budget
//! - Drives a bounded model/tool loop
//! - Streams events to the caller and persists the transcript
//!
//! # Architecture
//!
//! A request moves through a constrained pipeline:
//! 1. **Session** (`runtime`) - Claim the session, pin the version, append the query
//! 2. **Retrieval** (`ragway_core::retrieval`) - Embed, search, retry once, degrade
//! 3. **Context** (`context`) - Rank, trim to budget, render the prompt template
//! 4. **Generation** (`generation`) - Model turns and tool round trips as a state machine
//! 5. **Tools** (`tools`, `guardrails`) - Authorize, validate, execute under timeout
//!
//! # Key Types
//!
//! - `SessionOrchestrator` - Entry point (see `runtime` module)
//! - `LanguageModel` - Pluggable streaming model trait
//! - `ToolExecutionEngine` - Registry and executor for tools
//!
//! # Safety Principle
//!
//! The model only ever sees tools the pinned collection version allows and
//! the caller is permitted to use. Every tool call is validated against its
//! declared schema before any handler code runs.

pub mod context;
pub mod generation;
pub mod guardrails;
pub mod llm;
pub mod runtime;
pub mod stream;
pub mod tools;

pub use generation::{GenerationLimits, GenerationState};
pub use llm::{LanguageModel, ModelError, ModelEvent, ModelEventStream, ModelRequest, ToolCallRequest};
pub use runtime::{
    OrchestrationError, OrchestratorDependencies, OrchestratorSettings, SessionContext,
    SessionOrchestrator,
};
pub use stream::{EventStream, SessionEvent, UsageSummary};
pub use tools::{Tool, ToolError, ToolExecutionEngine, ToolFailure, ToolStats};
