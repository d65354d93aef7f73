// ABOUTME: Persistence boundary for session metadata
// ABOUTME: Trait plus an in-memory implementation for tests and single-process deployments

use crate::types::{Session, SessionState};
use async_trait::async_trait;
use chrono::Utc;
use corral_stream::ContentItem;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Session CRUD plus platform-link lookup.
///
/// `find_by_platform_link` resolves an external chat thread to its session
/// in a single call; callers must not issue the same lookup twice to
/// service one logical operation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn find_by_platform_link(&self, link: &str) -> Result<Option<Session>, StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    /// Persist a lifecycle transition, bumping the activity timestamps.
    async fn update_state(&self, id: &str, state: SessionState) -> Result<(), StoreError>;

    /// Persist the accumulated content buffer and its sequence watermark.
    async fn save_content(
        &self,
        id: &str,
        content: &[ContentItem],
        last_seq: u64,
    ) -> Result<(), StoreError>;

    async fn set_title(&self, id: &str, title: &str) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn find_by_platform_link(&self, link: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.platform_link.as_deref() == Some(link))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn update_state(&self, id: &str, state: SessionState) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.state = state;
        session.last_active_at = Utc::now();
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn save_content(
        &self,
        id: &str,
        content: &[ContentItem],
        last_seq: u64,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.content = content.to_vec();
        session.last_seq = last_seq;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.title = Some(title.to_string());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
