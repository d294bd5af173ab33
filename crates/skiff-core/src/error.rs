use thiserror::Error;

use skiff_sandbox::SandboxError;
use skiff_types::{ErrorCode, ErrorPayload};

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} belongs to another caller")]
    NotOwned(String),

    #[error("{0}")]
    Busy(String),

    #[error("{message}")]
    SandboxCreateFailed {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    Stream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Validation(_) => ErrorCode::ValidationError,
            SessionError::NotFound(_) => ErrorCode::SessionNotFound,
            SessionError::NotOwned(_) => ErrorCode::SessionNotOwned,
            SessionError::Busy(_) => ErrorCode::SessionBusy,
            SessionError::SandboxCreateFailed { .. } => ErrorCode::SandboxCreateFailed,
            SessionError::FileNotFound(_) => ErrorCode::FileNotFound,
            SessionError::Stream(_) => ErrorCode::StreamError,
            SessionError::Internal(_) | SessionError::Store(_) => ErrorCode::InternalError,
        }
    }

    /// Diagnostics travel only with `SANDBOX_CREATE_FAILED`.
    pub fn to_payload(&self) -> ErrorPayload {
        let diagnostics = match self {
            SessionError::SandboxCreateFailed { diagnostics, .. } => diagnostics.clone(),
            _ => None,
        };
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            diagnostics,
        }
    }
}

impl From<SandboxError> for SessionError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::CreateFailed {
                message,
                diagnostics,
            } => SessionError::SandboxCreateFailed {
                message,
                diagnostics,
            },
            SandboxError::FileNotFound(path) => SessionError::FileNotFound(path),
            SandboxError::InvalidPath(path) => {
                SessionError::Validation(format!("invalid path: {}", path))
            }
            other => SessionError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
