//! Typed parameters for the session operations, validated before they reach
//! an actor.

use serde::{Deserialize, Serialize};

use skiff_types::SessionSecrets;

use crate::error::{Result, SessionError};

pub const MAX_SESSION_ID_LEN: usize = 128;
pub const MAX_MESSAGE_CHARS: usize = 100_000;

pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::Validation(format!(
            "session id must be 1-{} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SessionError::Validation(
            "session id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub source_token: Option<String>,
    #[serde(default)]
    pub secrets: SessionSecrets,
}

impl InitializeRequest {
    /// Blank repo and token are treated as absent.
    pub fn validate(mut self) -> Result<Self> {
        self.repo = self
            .repo
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self.source_token = self.source_token.filter(|t| !t.trim().is_empty());
        if let Some(repo) = &self.repo {
            validate_repo(repo)?;
        }
        Ok(self)
    }
}

fn validate_repo(repo: &str) -> Result<()> {
    let segment_ok = |s: &str| {
        !s.is_empty()
            && s != "."
            && s != ".."
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match repo.split_once('/') {
        Some((owner, name)) if segment_ok(owner) && segment_ok(name) => Ok(()),
        _ => Err(SessionError::Validation(format!(
            "repo must look like owner/name: {}",
            repo
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

impl SendMessageRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn validate(self) -> Result<Self> {
        if self.content.trim().is_empty() {
            return Err(SessionError::Validation(
                "message content must not be empty".to_string(),
            ));
        }
        if self.content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(SessionError::Validation(format!(
                "message content exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        Ok(self)
    }
}

/// `""`, `"/"` and paths ending in `/` name directories; anything else is a
/// file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePathRequest {
    #[serde(default)]
    pub path: String,
}

impl FilePathRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn validate(self) -> Result<Self> {
        if self.path.contains('\0') {
            return Err(SessionError::Validation("path contains NUL".to_string()));
        }
        if !self.path.is_empty() && !self.path.starts_with('/') {
            return Err(SessionError::Validation(format!(
                "path must be absolute: {}",
                self.path
            )));
        }
        if self.path.split('/').any(|segment| segment == "..") {
            return Err(SessionError::Validation(format!(
                "path must not contain '..': {}",
                self.path
            )));
        }
        Ok(self)
    }

    pub fn is_listing(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/')
    }

    /// Path handed to the sandbox; the workspace root is spelled `""`.
    pub fn sandbox_path(&self) -> &str {
        if self.path == "/" {
            ""
        } else {
            &self.path
        }
    }
}
