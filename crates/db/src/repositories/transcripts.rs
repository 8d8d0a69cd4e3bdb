use async_trait::async_trait;
use ragway_core::domain::chunk::SourceAttribution;
use ragway_core::domain::collection::CollectionId;
use ragway_core::domain::session::{Message, MessageRole, Session, SessionId, SessionStatus};
use ragway_core::domain::tool::ToolCallRecord;
use ragway_core::persistence::{PersistenceError, TranscriptStore};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use super::collections::{parse_timestamp, to_i64, to_u64};
use super::RepositoryError;
use crate::DbPool;

/// Session transcripts in sqlite. Messages are keyed by
/// `(session_id, message_index)`, so re-appending a transcript only adds
/// the messages the table has not seen.
pub struct SqlTranscriptStore {
    pool: DbPool,
}

impl SqlTranscriptStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn append(&self, session: &Session) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chat_session (
                session_id,
                user_id,
                collection_id,
                collection_version,
                status,
                degraded,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                degraded = excluded.degraded,
                updated_at = excluded.updated_at",
        )
        .bind(&session.session_id.0)
        .bind(&session.user_id)
        .bind(&session.collection_id.0)
        .bind(to_i64("collection_version", session.collection_version)?)
        .bind(session.status.as_str())
        .bind(session.degraded)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let mut inserted = 0_u64;
        for message in &session.messages {
            let tool_call_json = message.tool_call.as_ref().map(encode_json).transpose()?;
            let sources_json = encode_json(&message.sources)?;
            inserted += sqlx::query(
                "INSERT INTO chat_message (
                    session_id,
                    message_index,
                    role,
                    content,
                    tool_call_json,
                    sources_json,
                    created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, message_index) DO NOTHING",
            )
            .bind(&session.session_id.0)
            .bind(i64::from(message.index))
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(tool_call_json)
            .bind(sources_json)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        debug!(
            event_name = "db.transcript.appended",
            session_id = %session.session_id,
            inserted_messages = inserted,
            status = session.status.as_str(),
            "transcript appended"
        );
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let Some(row) = sqlx::query(
            "SELECT
                session_id,
                user_id,
                collection_id,
                collection_version,
                status,
                degraded,
                created_at,
                updated_at
             FROM chat_session
             WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let messages = self.messages(session_id, -1, 0).await?;
        session_from_row(row, messages).map(Some)
    }

    async fn messages(
        &self,
        session_id: &SessionId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT message_index, role, content, tool_call_json, sources_json, created_at
             FROM chat_message
             WHERE session_id = ?
             ORDER BY message_index ASC
             LIMIT ? OFFSET ?",
        )
        .bind(&session_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl TranscriptStore for SqlTranscriptStore {
    async fn append_session(&self, session: &Session) -> Result<(), PersistenceError> {
        Ok(self.append(session).await?)
    }

    async fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Session>, PersistenceError> {
        Ok(self.load(session_id).await?)
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        Ok(self.messages(session_id, limit, offset).await?)
    }
}

fn session_from_row(row: SqliteRow, messages: Vec<Message>) -> Result<Session, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown session status `{status_raw}`")))?;

    Ok(Session {
        session_id: SessionId(row.try_get("session_id")?),
        user_id: row.try_get("user_id")?,
        collection_id: CollectionId(row.try_get("collection_id")?),
        collection_version: to_u64("collection_version", row.try_get("collection_version")?)?,
        messages,
        status,
        degraded: row.try_get("degraded")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;
    let index = row.try_get::<i64, _>("message_index")?;
    let tool_call = row
        .try_get::<Option<String>, _>("tool_call_json")?
        .map(|raw| decode_json::<ToolCallRecord>("tool_call_json", &raw))
        .transpose()?;
    let sources: Vec<SourceAttribution> =
        decode_json("sources_json", &row.try_get::<String, _>("sources_json")?)?;

    Ok(Message {
        index: u32::try_from(index)
            .map_err(|_| RepositoryError::Decode(format!("invalid message_index {index}")))?,
        role,
        content: row.try_get("content")?,
        tool_call,
        sources,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}
