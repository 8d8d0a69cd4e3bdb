use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::session::{Message, Session, SessionId};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("transcript store unavailable: {0}")]
    Unavailable(String),
    #[error("stored transcript is corrupt: {0}")]
    Corrupt(String),
}

impl From<PersistenceError> for ApplicationError {
    fn from(value: PersistenceError) -> Self {
        ApplicationError::Persistence(value.to_string())
    }
}

/// Durable home for session transcripts.
///
/// `append_session` must be idempotent: re-appending a transcript whose
/// messages were already stored updates the session row and inserts only
/// messages with unseen indexes.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append_session(&self, session: &Session) -> Result<(), PersistenceError>;

    async fn load_session(&self, session_id: &SessionId)
        -> Result<Option<Session>, PersistenceError>;

    async fn list_messages(
        &self,
        session_id: &SessionId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, PersistenceError> {
        let session = self.load_session(session_id).await?;
        Ok(session
            .map(|session| session.messages.into_iter().skip(offset).take(limit).collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryTranscriptStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn append_session(&self, session: &Session) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.session_id) {
            Some(stored) => {
                let next = stored.next_index();
                stored.messages.extend(
                    session.messages.iter().filter(|message| message.index >= next).cloned(),
                );
                stored.status = session.status;
                stored.degraded = session.degraded;
                stored.updated_at = session.updated_at;
            }
            None => {
                sessions.insert(session.session_id.clone(), session.clone());
            }
        }
        Ok(())
    }

    async fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Session>, PersistenceError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }
}
