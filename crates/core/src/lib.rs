pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod persistence;
pub mod registry;
pub mod retrieval;

pub use chrono;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::chunk::{RetrievedChunk, SourceAttribution};
pub use domain::collection::{
    CollectionConfig, CollectionId, CollectionVersion, FilterPredicate, RetrievalConfig,
};
pub use domain::session::{Message, MessageRole, Session, SessionId, SessionStatus};
pub use domain::tool::{
    Permission, ToolCallRecord, ToolCallStatus, ToolDescriptor, ToolId, ToolInvocation,
};
pub use errors::{ApplicationError, DomainError, ErrorKind, InterfaceError};
pub use persistence::{PersistenceError, TranscriptStore};
pub use registry::{CollectionRegistry, RegistryError};
