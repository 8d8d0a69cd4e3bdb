//! Collection registry: the single source of truth for which collection
//! version is active.
//!
//! Readers take a cheap `Arc` clone of the current snapshot and never block
//! on publishers. A publish builds the next snapshot off to the side and
//! swaps the pointer, so a reader sees either the whole old map or the whole
//! new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::domain::collection::{CollectionConfig, CollectionId, CollectionVersion};
use crate::errors::{ApplicationError, DomainError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("collection `{0}` not found")]
    NotFound(CollectionId),
    #[error("collection `{collection_id}` has no version {version_number}")]
    VersionNotFound { collection_id: CollectionId, version_number: u64 },
    #[error("invalid collection config: {0}")]
    InvalidConfig(String),
    #[error(
        "version {version_number} of `{collection_id}` does not follow version {current}"
    )]
    OutOfOrder { collection_id: CollectionId, version_number: u64, current: u64 },
}

impl From<RegistryError> for ApplicationError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::NotFound(_) | RegistryError::VersionNotFound { .. } => {
                ApplicationError::NotFound(value.to_string())
            }
            RegistryError::InvalidConfig(message) => {
                ApplicationError::Domain(DomainError::InvalidCollectionConfig(message))
            }
            RegistryError::OutOfOrder { .. } => {
                ApplicationError::Domain(DomainError::InvariantViolation(value.to_string()))
            }
        }
    }
}

type Snapshot = HashMap<CollectionId, Arc<Vec<Arc<CollectionVersion>>>>;

#[derive(Default)]
pub struct CollectionRegistry {
    current: RwLock<Arc<Snapshot>>,
    publish_lock: Mutex<()>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active version of a collection.
    pub fn resolve(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Arc<CollectionVersion>, RegistryError> {
        self.snapshot()
            .get(collection_id)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| RegistryError::NotFound(collection_id.clone()))
    }

    /// A specific, possibly superseded, version of a collection.
    pub fn version(
        &self,
        collection_id: &CollectionId,
        version_number: u64,
    ) -> Result<Arc<CollectionVersion>, RegistryError> {
        let snapshot = self.snapshot();
        let history =
            snapshot.get(collection_id).ok_or_else(|| RegistryError::NotFound(collection_id.clone()))?;
        history
            .iter()
            .find(|version| version.version_number == version_number)
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound {
                collection_id: collection_id.clone(),
                version_number,
            })
    }

    /// Every version of a collection, oldest first.
    pub fn versions(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<Arc<CollectionVersion>>, RegistryError> {
        self.snapshot()
            .get(collection_id)
            .map(|history| history.iter().cloned().collect())
            .ok_or_else(|| RegistryError::NotFound(collection_id.clone()))
    }

    pub fn collection_ids(&self) -> Vec<CollectionId> {
        let mut ids: Vec<_> = self.snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Creates the next version of a collection and makes it active.
    pub fn publish(
        &self,
        collection_id: CollectionId,
        config: CollectionConfig,
    ) -> Result<Arc<CollectionVersion>, RegistryError> {
        config.validate().map_err(RegistryError::InvalidConfig)?;

        let _guard = lock_ignoring_poison(&self.publish_lock);
        let snapshot = self.snapshot();
        let next_number = snapshot
            .get(&collection_id)
            .and_then(|history| history.last())
            .map(|version| version.version_number + 1)
            .unwrap_or(1);
        let version = Arc::new(CollectionVersion {
            collection_id,
            version_number: next_number,
            config,
            published_at: Utc::now(),
        });
        self.install(&snapshot, version.clone());

        info!(
            event_name = "registry.collection.published",
            collection_id = %version.collection_id,
            version_number = version.version_number,
            "published collection version"
        );
        Ok(version)
    }

    /// Republishes the config of an earlier version as a new version.
    pub fn restore(
        &self,
        collection_id: &CollectionId,
        version_number: u64,
    ) -> Result<Arc<CollectionVersion>, RegistryError> {
        let source = self.version(collection_id, version_number)?;
        let restored = self.publish(collection_id.clone(), source.config.clone())?;
        info!(
            event_name = "registry.collection.restored",
            collection_id = %collection_id,
            restored_from = version_number,
            version_number = restored.version_number,
            "restored collection version"
        );
        Ok(restored)
    }

    /// Installs versions loaded from durable storage. Each collection's
    /// versions must arrive in ascending order without gaps.
    pub fn hydrate(
        &self,
        versions: impl IntoIterator<Item = CollectionVersion>,
    ) -> Result<usize, RegistryError> {
        let _guard = lock_ignoring_poison(&self.publish_lock);
        let mut next = (*self.snapshot()).clone();
        let mut loaded = 0;
        for version in versions {
            version.config.validate().map_err(RegistryError::InvalidConfig)?;
            let history = next.entry(version.collection_id.clone()).or_default();
            let current = history.last().map(|v| v.version_number).unwrap_or(0);
            if version.version_number != current + 1 {
                return Err(RegistryError::OutOfOrder {
                    collection_id: version.collection_id,
                    version_number: version.version_number,
                    current,
                });
            }
            Arc::make_mut(history).push(Arc::new(version));
            loaded += 1;
        }
        self.swap(next);
        Ok(loaded)
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, base: &Snapshot, version: Arc<CollectionVersion>) {
        let mut next = base.clone();
        let history = next.entry(version.collection_id.clone()).or_default();
        Arc::make_mut(history).push(version);
        self.swap(next);
    }

    fn swap(&self, next: Snapshot) {
        let next = Arc::new(next);
        match self.current.write() {
            Ok(mut current) => *current = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

fn lock_ignoring_poison(mutex: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
