//! Tool execution engine.
//!
//! Every call is re-authorized against the pinned collection version, its
//! arguments are validated against the registered JSON Schema before the
//! handler is touched, and the handler runs under a hard timeout. A handler
//! that reports a transient failure gets one more attempt after a short
//! backoff. A timed-out call is reported, never retried.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonschema::Validator;
use ragway_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use ragway_core::domain::collection::CollectionVersion;
use ragway_core::domain::session::SessionId;
use ragway_core::domain::tool::{
    arguments_fingerprint, Permission, ToolCallStatus, ToolDescriptor, ToolId, ToolInvocation,
};
use ragway_core::errors::ErrorKind;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::guardrails::{evaluate_tool_access, GuardrailDecision};

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn execute(&self, input: Value) -> Result<Value, ToolFailure>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolFailure {
    pub message: String,
    /// The backend may succeed if asked again.
    pub transient: bool,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: false }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: true }
    }
}

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool `{0}` is not registered")]
    NotFound(ToolId),
    #[error("tool `{0}` is already registered with a different contract")]
    DuplicateTool(ToolId),
    #[error("tool `{tool_id}` has an invalid schema: {message}")]
    InvalidSchema { tool_id: ToolId, message: String },
    #[error("{message}")]
    Unauthorized { tool_id: ToolId, reason_code: &'static str, message: String },
    #[error("arguments for `{tool_id}` do not match its input schema: {}", .errors.join("; "))]
    SchemaViolation { tool_id: ToolId, errors: Vec<String> },
    #[error("tool `{tool_id}` timed out after {timeout_ms}ms")]
    Timeout { tool_id: ToolId, timeout_ms: u64 },
    #[error("tool `{tool_id}` failed: {message}")]
    Failed { tool_id: ToolId, message: String },
    #[error("tool `{tool_id}` returned output that does not match its schema: {}", .errors.join("; "))]
    InvalidOutput { tool_id: ToolId, errors: Vec<String> },
    #[error("tool `{0}` call was abandoned")]
    Abandoned(ToolId),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateTool(_) | Self::InvalidSchema { .. } => ErrorKind::InvalidRequest,
            Self::Unauthorized { .. } => ErrorKind::PermissionDenied,
            Self::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            Self::Timeout { .. } => ErrorKind::ToolTimeout,
            Self::Failed { .. } | Self::InvalidOutput { .. } => ErrorKind::ToolError,
            Self::Abandoned(_) => ErrorKind::Aborted,
        }
    }

    pub fn call_status(&self) -> ToolCallStatus {
        match self {
            Self::NotFound(_)
            | Self::DuplicateTool(_)
            | Self::InvalidSchema { .. }
            | Self::Unauthorized { .. }
            | Self::SchemaViolation { .. } => ToolCallStatus::Rejected,
            Self::Timeout { .. } => ToolCallStatus::Timeout,
            Self::Failed { .. } | Self::InvalidOutput { .. } => ToolCallStatus::Failed,
            Self::Abandoned(_) => ToolCallStatus::Abandoned,
        }
    }
}

/// Running counters per tool. Rejected calls never reach the handler and
/// are counted apart from executions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ToolStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub abandoned_count: u64,
    pub rejected_count: u64,
    pub total_duration_ms: u64,
}

impl ToolStats {
    pub fn average_duration_ms(&self) -> u64 {
        if self.execution_count == 0 {
            return 0;
        }
        self.total_duration_ms / self.execution_count
    }

    fn record(&mut self, status: ToolCallStatus, elapsed: Duration) {
        if status == ToolCallStatus::Rejected {
            self.rejected_count += 1;
            return;
        }
        self.execution_count += 1;
        self.total_duration_ms += elapsed.as_millis() as u64;
        match status {
            ToolCallStatus::Completed => self.success_count += 1,
            ToolCallStatus::Failed => self.failure_count += 1,
            ToolCallStatus::Timeout => self.timeout_count += 1,
            ToolCallStatus::Abandoned => self.abandoned_count += 1,
            ToolCallStatus::Rejected => {}
        }
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    input_validator: Validator,
    output_validator: Option<Validator>,
    tool: Arc<dyn Tool>,
}

type ToolTable = HashMap<ToolId, Arc<RegisteredTool>>;
type ResourceSlot = (SessionId, String);

pub struct ToolExecutionEngine {
    tools: RwLock<Arc<ToolTable>>,
    register_lock: Mutex<()>,
    resource_locks: Mutex<HashMap<ResourceSlot, Arc<AsyncMutex<()>>>>,
    stats: Mutex<HashMap<ToolId, ToolStats>>,
    timeout: Duration,
    retry_backoff: Duration,
    audit: Arc<dyn AuditSink>,
}

impl ToolExecutionEngine {
    pub fn new(timeout: Duration, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            tools: RwLock::new(Arc::new(HashMap::new())),
            register_lock: Mutex::new(()),
            resource_locks: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            timeout,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            audit,
        }
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Adds a tool. Registering the same contract twice is a no-op; a
    /// different contract under an existing id is rejected.
    pub fn register<T>(&self, tool: T) -> Result<(), ToolError>
    where
        T: Tool + 'static,
    {
        let descriptor = tool.descriptor();
        let tool_id = descriptor.tool_id.clone();
        let input_validator = compile_schema(&tool_id, &descriptor.input_schema)?;
        let output_validator = match &descriptor.output_schema {
            Some(schema) => Some(compile_schema(&tool_id, schema)?),
            None => None,
        };

        let _guard = lock(&self.register_lock);
        let current = self.table();
        if let Some(existing) = current.get(&tool_id) {
            if existing.descriptor.same_contract(&descriptor) {
                return Ok(());
            }
            return Err(ToolError::DuplicateTool(tool_id));
        }

        let mut next = (*current).clone();
        next.insert(
            tool_id.clone(),
            Arc::new(RegisteredTool {
                descriptor,
                input_validator,
                output_validator,
                tool: Arc::new(tool),
            }),
        );
        match self.tools.write() {
            Ok(mut tools) => *tools = Arc::new(next),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
        }

        info!(event_name = "tool.registered", tool_id = %tool_id, "registered tool");
        Ok(())
    }

    pub fn descriptor(&self, tool_id: &ToolId) -> Option<ToolDescriptor> {
        self.table().get(tool_id).map(|registered| registered.descriptor.clone())
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<_> =
            self.table().values().map(|registered| registered.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        descriptors
    }

    pub fn authorize(
        &self,
        tool_id: &ToolId,
        version: &CollectionVersion,
        granted: &BTreeSet<Permission>,
    ) -> bool {
        self.table()
            .get(tool_id)
            .map(|registered| {
                evaluate_tool_access(&registered.descriptor, version, granted).is_allowed()
            })
            .unwrap_or(false)
    }

    /// Tools the model may be offered for this version and caller, in the
    /// order the version lists them.
    pub fn authorized_descriptors(
        &self,
        version: &CollectionVersion,
        granted: &BTreeSet<Permission>,
    ) -> Vec<ToolDescriptor> {
        let table = self.table();
        version
            .config
            .allowed_tools
            .iter()
            .filter_map(|tool_id| table.get(tool_id))
            .map(|registered| &registered.descriptor)
            .filter(|descriptor| evaluate_tool_access(descriptor, version, granted).is_allowed())
            .cloned()
            .collect()
    }

    pub fn stats(&self, tool_id: &ToolId) -> Option<ToolStats> {
        lock(&self.stats).get(tool_id).cloned()
    }

    pub fn all_stats(&self) -> Vec<(ToolId, ToolStats)> {
        let mut stats: Vec<_> =
            lock(&self.stats).iter().map(|(id, stats)| (id.clone(), stats.clone())).collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub async fn execute(
        &self,
        invocation: ToolInvocation,
        cancellation: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let started = Instant::now();
        let result = self.admit_and_run(&invocation, cancellation).await;
        self.record(&invocation, &result, started.elapsed());
        result
    }

    async fn admit_and_run(
        &self,
        invocation: &ToolInvocation,
        cancellation: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let registered = self
            .table()
            .get(&invocation.tool_id)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(invocation.tool_id.clone()))?;

        if let GuardrailDecision::Deny { reason_code, message } = evaluate_tool_access(
            &registered.descriptor,
            &invocation.collection_version,
            &invocation.granted_permissions,
        ) {
            return Err(ToolError::Unauthorized {
                tool_id: invocation.tool_id.clone(),
                reason_code,
                message,
            });
        }

        let errors = schema_errors(&registered.input_validator, &invocation.arguments);
        if !errors.is_empty() {
            return Err(ToolError::SchemaViolation { tool_id: invocation.tool_id.clone(), errors });
        }

        let Some(key) = registered.descriptor.resource_key.clone() else {
            return self.run(&registered, invocation, cancellation).await;
        };

        let slot = (invocation.requester.clone(), key);
        let resource = self.resource_lock(&slot);
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ToolError::Abandoned(invocation.tool_id.clone())),
            result = async {
                let _held = resource.lock().await;
                self.run(&registered, invocation, cancellation).await
            } => result,
        };
        drop(resource);
        self.release_resource(&slot);
        result
    }

    async fn run(
        &self,
        registered: &RegisteredTool,
        invocation: &ToolInvocation,
        cancellation: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let tool_id = invocation.tool_id.clone();
        let output = match self.attempt(registered, invocation, cancellation).await? {
            Ok(output) => output,
            Err(failure) if failure.transient => {
                warn!(
                    event_name = "tool.invocation.retry",
                    correlation_id = %invocation.correlation_id,
                    tool_id = %tool_id,
                    error = %failure,
                    "transient tool failure, retrying once"
                );
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(ToolError::Abandoned(tool_id)),
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
                self.attempt(registered, invocation, cancellation)
                    .await?
                    .map_err(|failure| ToolError::Failed {
                        tool_id: tool_id.clone(),
                        message: failure.message,
                    })?
            }
            Err(failure) => {
                return Err(ToolError::Failed { tool_id, message: failure.message });
            }
        };

        if let Some(validator) = &registered.output_validator {
            let errors = schema_errors(validator, &output);
            if !errors.is_empty() {
                return Err(ToolError::InvalidOutput { tool_id, errors });
            }
        }
        Ok(output)
    }

    /// One handler call under the timeout. The outer error ends the call;
    /// the inner one is the handler's own failure.
    async fn attempt(
        &self,
        registered: &RegisteredTool,
        invocation: &ToolInvocation,
        cancellation: &CancellationToken,
    ) -> Result<Result<Value, ToolFailure>, ToolError> {
        let tool_id = invocation.tool_id.clone();
        let call = registered.tool.execute(invocation.arguments.clone());
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ToolError::Abandoned(tool_id)),
            outcome = tokio::time::timeout(self.timeout, call) => {
                outcome.map_err(|_| ToolError::Timeout {
                    tool_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    fn record(&self, invocation: &ToolInvocation, result: &Result<Value, ToolError>, elapsed: Duration) {
        let status = match result {
            Ok(_) => ToolCallStatus::Completed,
            Err(error) => error.call_status(),
        };
        if !matches!(result, Err(ToolError::NotFound(_))) {
            lock(&self.stats).entry(invocation.tool_id.clone()).or_default().record(status, elapsed);
        }

        let outcome = match status {
            ToolCallStatus::Completed => AuditOutcome::Success,
            ToolCallStatus::Failed | ToolCallStatus::Timeout => AuditOutcome::Failed,
            ToolCallStatus::Rejected => AuditOutcome::Rejected,
            ToolCallStatus::Abandoned => AuditOutcome::Abandoned,
        };
        let context = AuditContext::new(
            Some(invocation.requester.clone()),
            Some(invocation.collection_version.collection_id.clone()),
            invocation.correlation_id.clone(),
            "tool-engine",
        );
        let mut event = context
            .event("tool.invocation", AuditCategory::Tool, outcome)
            .with_metadata("tool_id", invocation.tool_id.0.clone())
            .with_metadata("call_id", invocation.call_id.clone())
            .with_metadata("status", status.as_str())
            .with_metadata("duration_ms", elapsed.as_millis().to_string())
            .with_metadata("arguments_fingerprint", arguments_fingerprint(&invocation.arguments))
            .with_metadata(
                "collection_version",
                invocation.collection_version.version_number.to_string(),
            );
        if let Err(error) = result {
            event = event.with_metadata("error_kind", error.kind().as_str());
            warn!(
                event_name = "tool.invocation.unsuccessful",
                correlation_id = %invocation.correlation_id,
                session_id = %invocation.requester,
                tool_id = %invocation.tool_id,
                status = status.as_str(),
                error = %error,
                "tool call did not complete"
            );
        } else {
            info!(
                event_name = "tool.invocation.completed",
                correlation_id = %invocation.correlation_id,
                session_id = %invocation.requester,
                tool_id = %invocation.tool_id,
                duration_ms = elapsed.as_millis() as u64,
                "tool call completed"
            );
        }
        self.audit.emit(event);
    }

    fn table(&self) -> Arc<ToolTable> {
        match self.tools.read() {
            Ok(tools) => tools.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn resource_lock(&self, slot: &ResourceSlot) -> Arc<AsyncMutex<()>> {
        lock(&self.resource_locks).entry(slot.clone()).or_default().clone()
    }

    fn release_resource(&self, slot: &ResourceSlot) {
        let mut locks = lock(&self.resource_locks);
        if locks.get(slot).is_some_and(|resource| Arc::strong_count(resource) == 1) {
            locks.remove(slot);
        }
    }
}

fn compile_schema(tool_id: &ToolId, schema: &Value) -> Result<Validator, ToolError> {
    jsonschema::validator_for(schema).map_err(|error| ToolError::InvalidSchema {
        tool_id: tool_id.clone(),
        message: error.to_string(),
    })
}

fn schema_errors(validator: &Validator, value: &Value) -> Vec<String> {
    validator
        .iter_errors(value)
        .map(|error| {
            let path = error.instance_path.to_string();
            if path.is_empty() {
                error.to_string()
            } else {
                format!("at '{path}': {error}")
            }
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
