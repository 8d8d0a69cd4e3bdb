use ragway_core::chrono::{DateTime, Utc};
use ragway_core::domain::collection::{CollectionConfig, CollectionId, CollectionVersion};
use sqlx::{sqlite::SqliteRow, Row};

use super::{CollectionVersionRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCollectionVersionRepository {
    pool: DbPool,
}

impl SqlCollectionVersionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CollectionVersionRepository for SqlCollectionVersionRepository {
    async fn save(&self, version: &CollectionVersion) -> Result<(), RepositoryError> {
        let config_json = serde_json::to_string(&version.config)
            .map_err(|error| RepositoryError::Decode(format!("encode collection config: {error}")))?;

        sqlx::query(
            "INSERT INTO collection_version (
                collection_id,
                version_number,
                config_json,
                published_at
             ) VALUES (?, ?, ?, ?)
             ON CONFLICT(collection_id, version_number) DO NOTHING",
        )
        .bind(&version.collection_id.0)
        .bind(to_i64("version_number", version.version_number)?)
        .bind(config_json)
        .bind(version.published_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        collection_id: &CollectionId,
        version_number: u64,
    ) -> Result<Option<CollectionVersion>, RepositoryError> {
        let row = sqlx::query(
            "SELECT collection_id, version_number, config_json, published_at
             FROM collection_version
             WHERE collection_id = ? AND version_number = ?",
        )
        .bind(&collection_id.0)
        .bind(to_i64("version_number", version_number)?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(version_from_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<CollectionVersion>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT collection_id, version_number, config_json, published_at
             FROM collection_version
             ORDER BY collection_id ASC, version_number ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(version_from_row).collect()
    }
}

fn version_from_row(row: SqliteRow) -> Result<CollectionVersion, RepositoryError> {
    let config_json = row.try_get::<String, _>("config_json")?;
    let config: CollectionConfig = serde_json::from_str(&config_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid config_json: {error}")))?;

    Ok(CollectionVersion {
        collection_id: CollectionId(row.try_get("collection_id")?),
        version_number: to_u64("version_number", row.try_get("version_number")?)?,
        config,
        published_at: parse_timestamp("published_at", row.try_get("published_at")?)?,
    })
}

pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("value for `{column}` out of range: {value}")))
}

pub(crate) fn to_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("invalid value for `{column}` (expected non-negative): {value}"))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
