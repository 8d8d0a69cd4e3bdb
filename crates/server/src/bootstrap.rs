use std::sync::Arc;

use ragway_agent::{
    OrchestratorDependencies, OrchestratorSettings, SessionOrchestrator, ToolExecutionEngine,
};
use ragway_core::audit::{AuditSink, TracingAuditSink};
use ragway_core::config::{
    AppConfig, ConfigError, LoadOptions, VectorIndexConfig, VectorIndexProvider,
};
use ragway_core::persistence::TranscriptStore;
use ragway_core::registry::{CollectionRegistry, RegistryError};
use ragway_core::retrieval::{InMemoryVectorIndex, VectorIndex};
use ragway_db::{
    connect, migrations, CollectionVersionRepository, DbPool, RepositoryError,
    SqlCollectionVersionRepository, SqlTranscriptStore,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::providers::{HttpChatModel, HttpEmbeddingProvider};
use crate::qdrant::QdrantVectorIndex;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub registry: Arc<CollectionRegistry>,
    pub versions: Arc<dyn CollectionVersionRepository>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub tools: Arc<ToolExecutionEngine>,
    pub orchestrator: SessionOrchestrator,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("loading published collections failed: {0}")]
    Repository(#[from] RepositoryError),
    #[error("persisted collection versions are inconsistent: {0}")]
    Hydrate(#[from] RegistryError),
    #[error("provider client setup failed: {0}")]
    Provider(#[from] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.database_ready",
        correlation_id = "bootstrap",
        "database connected and migrated"
    );

    let versions: Arc<dyn CollectionVersionRepository> =
        Arc::new(SqlCollectionVersionRepository::new(db_pool.clone()));
    let registry = Arc::new(CollectionRegistry::new());
    let loaded = registry.hydrate(versions.list_all().await?)?;
    info!(
        event_name = "system.bootstrap.registry_hydrated",
        correlation_id = "bootstrap",
        loaded_versions = loaded,
        collections = registry.collection_ids().len(),
        "collection registry hydrated"
    );

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let transcripts: Arc<dyn TranscriptStore> = Arc::new(SqlTranscriptStore::new(db_pool.clone()));
    let index = vector_index(&config.vector_index)?;
    let tools = Arc::new(
        ToolExecutionEngine::new(config.orchestration.tool_timeout(), audit.clone())
            .with_retry_backoff(config.orchestration.tool_retry_backoff()),
    );

    let orchestrator = SessionOrchestrator::new(
        OrchestratorDependencies {
            registry: registry.clone(),
            embedder: Arc::new(HttpEmbeddingProvider::from_config(&config.embedding)?),
            index,
            model: Arc::new(HttpChatModel::from_config(&config.llm)?),
            tools: tools.clone(),
            store: transcripts.clone(),
            audit,
        },
        OrchestratorSettings::from(&config.orchestration),
    );

    Ok(Application { config, db_pool, registry, versions, transcripts, tools, orchestrator })
}

fn vector_index(config: &VectorIndexConfig) -> Result<Arc<dyn VectorIndex>, BootstrapError> {
    let index: Arc<dyn VectorIndex> = match config.provider {
        VectorIndexProvider::Qdrant => Arc::new(QdrantVectorIndex::from_config(config)?),
        VectorIndexProvider::Memory => {
            warn!(
                event_name = "system.bootstrap.memory_index",
                correlation_id = "bootstrap",
                "vector_index.provider is memory; retrieval starts with an empty index"
            );
            Arc::new(InMemoryVectorIndex::new())
        }
    };
    info!(
        event_name = "system.bootstrap.vector_index_ready",
        correlation_id = "bootstrap",
        provider = ?config.provider,
        "vector index configured"
    );
    Ok(index)
}
