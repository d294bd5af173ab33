use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Idle,
    Running,
    Paused,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a booted sandbox: the compute unit id plus the public URL of
/// the agent server running inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub endpoint_url: String,
}

/// Persistent state of one session. Owner and secrets live in separate
/// records and are never part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    #[serde(default, rename = "sandboxHandle")]
    pub sandbox: Option<SandboxHandle>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub agent_conversation_id: Option<String>,
    #[serde(default)]
    pub is_processing: bool,
    #[serde(default)]
    pub repo: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Reason for the last transition into `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_diagnostics: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, repo: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Starting,
            sandbox: None,
            snapshot_id: None,
            agent_conversation_id: None,
            is_processing: false,
            repo,
            created_at: now,
            last_activity_at: now,
            last_error: None,
            last_diagnostics: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn public_state(&self) -> SessionPublicState {
        SessionPublicState {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// The only projection of a session that leaves the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPublicState {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnershipCheck {
    pub exists: bool,
    pub owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminateAck {
    pub status: String,
}

impl TerminateAck {
    pub fn terminated() -> Self {
        Self {
            status: "terminated".to_string(),
        }
    }
}

/// Credentials needed to drive a session's sandbox. Captured once at
/// initialize time.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSecrets {
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub controller_url: Option<String>,
    #[serde(default)]
    pub controller_token: Option<String>,
    /// Additional variables exported to the agent server (provider keys etc).
    #[serde(default)]
    pub agent_env: BTreeMap<String, String>,
}

impl fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "***"))
            .field("controller_url", &self.controller_url)
            .field("controller_token", &self.controller_token.as_ref().map(|_| "***"))
            .field("agent_env", &self.agent_env.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub secrets: SessionSecrets,
    #[serde(default)]
    pub source_token: Option<String>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secrets", &self.secrets)
            .field("source_token", &self.source_token.as_ref().map(|_| "***"))
            .finish()
    }
}
