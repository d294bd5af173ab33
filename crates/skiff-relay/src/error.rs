use thiserror::Error;

use skiff_runtime::HttpError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to subscribe to agent events: {0}")]
    Subscribe(HttpError),

    #[error("failed to submit prompt: {0}")]
    Prompt(HttpError),

    #[error("event stream error: {0}")]
    Stream(String),

    #[error("undecodable event: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
