use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Retryable;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request failed ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout(err.to_string())
        } else if err.is_decode() {
            HttpError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            HttpError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            HttpError::Network(err.to_string())
        }
    }
}

/// Network failures, 5xx and 429 are transient; other statuses are caller
/// errors and are not repeated.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

impl Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        match self {
            HttpError::Network(_) | HttpError::Timeout(_) => true,
            HttpError::Status { status, .. } => is_retryable_status(*status),
            HttpError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

fn auth_headers(bearer_token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer_token.filter(|t| !t.trim().is_empty()) {
        if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {}", token.trim())) {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}

/// Client for request/response calls. Every request carries the configured
/// timeout.
pub fn build_http_client(
    config: &HttpConfig,
    bearer_token: Option<&str>,
) -> Result<Client, HttpError> {
    Client::builder()
        .default_headers(auth_headers(bearer_token))
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .build()
        .map_err(|e| HttpError::Network(format!("failed to create HTTP client: {}", e)))
}

/// Client for long-lived event streams: connect timeout only, no global
/// request timeout.
pub fn build_stream_client(
    config: &HttpConfig,
    bearer_token: Option<&str>,
) -> Result<Client, HttpError> {
    Client::builder()
        .default_headers(auth_headers(bearer_token))
        .http1_only()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| HttpError::Network(format!("failed to create stream client: {}", e)))
}

/// Turns a non-success response into [`HttpError::Status`] with the body
/// attached (truncated).
pub async fn ensure_success(response: Response) -> Result<Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let body = truncate(&body, 500);
    tracing::debug!("request to {} failed ({}): {}", url, status, body);
    Err(HttpError::Status {
        status: status.as_u16(),
        body,
    })
}

pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, HttpError> {
    let response = ensure_success(response).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        HttpError::Decode(format!("{}. Body: {}", e, truncate(&body, 200)))
    })
}

pub fn truncate(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
