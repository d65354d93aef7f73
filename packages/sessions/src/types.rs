// ABOUTME: Session type definitions and lifecycle states
// ABOUTME: Sessions outlive streams; only explicit deletion removes them

use chrono::{DateTime, Utc};
use corral_stream::ContentItem;
use serde::{Deserialize, Serialize};

/// Session lifecycle state.
///
/// `idle --send--> streaming --done/error/typed_error--> idle|error`;
/// `streaming --abort--> aborted`. Stream completion never deletes a
/// session; an idle session keeps accepting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Streaming,
    Error,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Error => "error",
            SessionState::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(SessionState::Idle),
            "streaming" => Some(SessionState::Streaming),
            "error" => Some(SessionState::Error),
            "aborted" => Some(SessionState::Aborted),
            _ => None,
        }
    }
}

/// Capability tier an agent execution runs under. Passed to the agent as
/// an environment variable; the agent enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Restricted,
    Standard,
    Full,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::Standard
    }
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Restricted => "restricted",
            TrustLevel::Standard => "standard",
            TrustLevel::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "restricted" => Some(TrustLevel::Restricted),
            "standard" => Some(TrustLevel::Standard),
            "full" => Some(TrustLevel::Full),
            _ => None,
        }
    }
}

/// One conversation bound to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Owning workspace slug.
    pub workspace_id: String,
    pub state: SessionState,
    /// Agent flavor to launch ("coder", "researcher", ...).
    pub agent_kind: String,
    pub trust_level: TrustLevel,
    /// Display title, settable by the agent via a session event.
    pub title: Option<String>,
    /// External chat-thread key for bridge adapters.
    pub platform_link: Option<String>,
    /// Working directory within the vault, if not the vault root.
    pub cwd: Option<String>,
    /// Accumulated content, persisted at terminal transitions.
    pub content: Vec<ContentItem>,
    /// Event sequence watermark matching `content`.
    pub last_seq: u64,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub workspace_id: String,
    pub agent_kind: String,
    #[serde(default)]
    pub trust_level: TrustLevel,
    pub title: Option<String>,
    pub platform_link: Option<String>,
    pub cwd: Option<String>,
}

/// Express a working directory relative to the vault mount.
///
/// The agent must never learn the host filesystem layout: absolute paths
/// and traversal components collapse to the vault root instead of being
/// passed through.
pub fn vault_relative(path: &str) -> String {
    if path.starts_with('/') || path.split('/').any(|c| c == "..") {
        return ".".to_string();
    }
    let parts: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
