// ABOUTME: SQLite-backed session store via sqlx
// ABOUTME: Runtime-checked queries; content buffers stored as JSON text

use crate::store::{SessionStore, StoreError};
use crate::types::{Session, SessionState, TrustLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_stream::ContentItem;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Session store on a SQLite pool.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations in one step.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(url).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the sessions table if it does not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                state TEXT NOT NULL,
                agent_kind TEXT NOT NULL,
                trust_level TEXT NOT NULL,
                title TEXT,
                platform_link TEXT,
                cwd TEXT,
                content TEXT NOT NULL DEFAULT '[]',
                last_seq INTEGER NOT NULL DEFAULT 0,
                last_active_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_platform_link
             ON sessions(platform_link)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Session store migrated");
        Ok(())
    }
}

fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let state_raw: String = row.try_get("state")?;
    let state = SessionState::parse(&state_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown session state {:?}", state_raw)))?;

    let trust_raw: String = row.try_get("trust_level")?;
    let trust_level = TrustLevel::parse(&trust_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown trust level {:?}", trust_raw)))?;

    let content_raw: String = row.try_get("content")?;
    let content: Vec<ContentItem> = serde_json::from_str(&content_raw)?;

    let last_seq: i64 = row.try_get("last_seq")?;

    Ok(Session {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        state,
        agent_kind: row.try_get("agent_kind")?,
        trust_level,
        title: row.try_get("title")?,
        platform_link: row.try_get("platform_link")?,
        cwd: row.try_get("cwd")?,
        content,
        last_seq: last_seq as u64,
        last_active_at: row.try_get::<DateTime<Utc>, _>("last_active_at")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        let content = serde_json::to_string(&session.content)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, workspace_id, state, agent_kind, trust_level,
                title, platform_link, cwd, content, last_seq,
                last_active_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.workspace_id)
        .bind(session.state.as_str())
        .bind(&session.agent_kind)
        .bind(session.trust_level.as_str())
        .bind(&session.title)
        .bind(&session.platform_link)
        .bind(&session.cwd)
        .bind(content)
        .bind(session.last_seq as i64)
        .bind(session.last_active_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_by_platform_link(&self, link: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE platform_link = ?")
            .bind(link)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn update_state(&self, id: &str, state: SessionState) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET state = ?, last_active_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn save_content(
        &self,
        id: &str,
        content: &[ContentItem],
        last_seq: u64,
    ) -> Result<(), StoreError> {
        let content = serde_json::to_string(content)?;
        let result = sqlx::query(
            "UPDATE sessions SET content = ?, last_seq = ?, updated_at = ? WHERE id = ?",
        )
        .bind(content)
        .bind(last_seq as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn store() -> SqliteSessionStore {
        SqliteSessionStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store")
    }

    fn session(id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            workspace_id: "notes".to_string(),
            state: SessionState::Idle,
            agent_kind: "coder".to_string(),
            trust_level: TrustLevel::Standard,
            title: None,
            platform_link: Some(format!("telegram:{}", id)),
            cwd: Some("projects/demo".to_string()),
            content: Vec::new(),
            last_seq: 0,
            last_active_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let store = store().await;
        store.create(session("s1")).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.workspace_id, "notes");
        assert_eq!(loaded.trust_level, TrustLevel::Standard);
        assert_eq!(loaded.cwd.as_deref(), Some("projects/demo"));
        assert_eq!(loaded.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_state_transition_persists() {
        let store = store().await;
        store.create(session("s1")).await.unwrap();

        store
            .update_state("s1", SessionState::Streaming)
            .await
            .unwrap();
        assert_eq!(
            store.get("s1").await.unwrap().unwrap().state,
            SessionState::Streaming
        );

        store.update_state("s1", SessionState::Idle).await.unwrap();
        assert_eq!(
            store.get("s1").await.unwrap().unwrap().state,
            SessionState::Idle
        );
    }

    #[tokio::test]
    async fn test_content_round_trips_as_json() {
        let store = store().await;
        store.create(session("s1")).await.unwrap();

        let content = vec![
            ContentItem::Text {
                text: "hello".into(),
            },
            ContentItem::ToolUse {
                id: "t1".into(),
                name: "bash".into(),
                input: serde_json::json!({"cmd": "ls"}),
            },
        ];
        store.save_content("s1", &content, 7).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.content, content);
        assert_eq!(loaded.last_seq, 7);
    }

    #[tokio::test]
    async fn test_platform_link_lookup_is_single_call() {
        let store = store().await;
        store.create(session("s1")).await.unwrap();
        store.create(session("s2")).await.unwrap();

        let found = store
            .find_by_platform_link("telegram:s2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "s2");
    }

    #[tokio::test]
    async fn test_missing_rows_surface_not_found() {
        let store = store().await;
        assert!(matches!(
            store.update_state("ghost", SessionState::Idle).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.set_title("ghost", "t").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
