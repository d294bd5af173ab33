use thiserror::Error;

use skiff_runtime::HttpError;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Provisioning, setup or health polling failed. `diagnostics` holds the
    /// process table, listener status and agent log tail when available.
    #[error("sandbox creation failed: {message}")]
    CreateFailed {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("command failed in sandbox: {0}")]
    Exec(String),

    #[error("compute backend error: {0}")]
    Backend(#[from] HttpError),

    #[error("sandbox is not running: {0}")]
    NotRunning(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl SandboxError {
    pub fn create_failed(message: impl Into<String>) -> Self {
        SandboxError::CreateFailed {
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            SandboxError::CreateFailed { diagnostics, .. } => diagnostics.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
