use std::collections::BTreeMap;

use tokio::sync::RwLock;

use ragway_core::domain::collection::{CollectionId, CollectionVersion};

use super::{CollectionVersionRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryCollectionVersionRepository {
    versions: RwLock<BTreeMap<(CollectionId, u64), CollectionVersion>>,
}

#[async_trait::async_trait]
impl CollectionVersionRepository for InMemoryCollectionVersionRepository {
    async fn save(&self, version: &CollectionVersion) -> Result<(), RepositoryError> {
        let mut versions = self.versions.write().await;
        versions
            .entry((version.collection_id.clone(), version.version_number))
            .or_insert_with(|| version.clone());
        Ok(())
    }

    async fn find(
        &self,
        collection_id: &CollectionId,
        version_number: u64,
    ) -> Result<Option<CollectionVersion>, RepositoryError> {
        let versions = self.versions.read().await;
        Ok(versions.get(&(collection_id.clone(), version_number)).cloned())
    }

    async fn list_all(&self) -> Result<Vec<CollectionVersion>, RepositoryError> {
        let versions = self.versions.read().await;
        Ok(versions.values().cloned().collect())
    }
}
