use async_trait::async_trait;
use thiserror::Error;

use ragway_core::domain::collection::{CollectionId, CollectionVersion};
use ragway_core::persistence::PersistenceError;

pub mod collections;
pub mod memory;
pub mod transcripts;

pub use collections::SqlCollectionVersionRepository;
pub use memory::InMemoryCollectionVersionRepository;
pub use transcripts::SqlTranscriptStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for PersistenceError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => PersistenceError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => PersistenceError::Corrupt(message),
        }
    }
}

/// Durable log of published collection versions, replayed into the
/// registry at startup.
#[async_trait]
pub trait CollectionVersionRepository: Send + Sync {
    /// Stores a version. Saving the same version twice is a no-op.
    async fn save(&self, version: &CollectionVersion) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        collection_id: &CollectionId,
        version_number: u64,
    ) -> Result<Option<CollectionVersion>, RepositoryError>;

    /// Every stored version, ordered by collection then version number.
    async fn list_all(&self) -> Result<Vec<CollectionVersion>, RepositoryError>;
}
