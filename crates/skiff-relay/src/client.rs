use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use skiff_runtime::{
    build_http_client, build_stream_client, ensure_success, retry, HttpConfig, HttpError,
    RetryPolicy,
};

use crate::error::{RelayError, Result};
use crate::sse::{decode_frame, FrameBuffer, RawAgentEvent};

pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawAgentEvent>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Events buffered between the relay and a slow caller.
    pub channel_capacity: usize,
    /// The prompt call returns only when the turn is over, so it gets a
    /// much longer timeout than ordinary requests.
    pub prompt_timeout_ms: u64,
    /// Upper bound on one SSE frame; a larger frame ends the feed.
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            prompt_timeout_ms: 600_000,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// The agent server running inside a sandbox, addressed by its endpoint URL.
#[async_trait]
pub trait AgentServerClient: Send + Sync {
    /// Resolves once the feed is open; events are read lazily from the
    /// returned stream.
    async fn subscribe(&self, endpoint: &str) -> Result<RawEventStream>;

    /// Blocks until the agent finishes the turn.
    async fn send_prompt(&self, endpoint: &str, conversation_id: &str, text: &str) -> Result<()>;
}

pub struct OpenCodeClient {
    client: Client,
    stream_client: Client,
    retry: RetryPolicy,
    max_frame_bytes: usize,
}

impl OpenCodeClient {
    pub fn new(
        http: &HttpConfig,
        relay: &RelayConfig,
        retry: RetryPolicy,
    ) -> std::result::Result<Self, HttpError> {
        let prompt_http = HttpConfig {
            request_timeout_ms: relay.prompt_timeout_ms,
            ..http.clone()
        };
        Ok(Self {
            client: build_http_client(&prompt_http, None)?,
            stream_client: build_stream_client(http, None)?,
            retry,
            max_frame_bytes: relay.max_frame_bytes,
        })
    }
}

#[async_trait]
impl AgentServerClient for OpenCodeClient {
    async fn subscribe(&self, endpoint: &str) -> Result<RawEventStream> {
        let url = format!("{}/event", endpoint.trim_end_matches('/'));
        tracing::debug!("Subscribing to agent events at {}", url);

        let (client, url) = (&self.stream_client, url.as_str());
        let response = retry(&self.retry, "relay.subscribe", || async move {
            let response = client
                .get(url)
                .header("Accept", "text/event-stream")
                .send()
                .await?;
            ensure_success(response).await
        })
        .await
        .map_err(RelayError::Subscribe)?;

        let bytes = response.bytes_stream();
        let mut frames = FrameBuffer::new(self.max_frame_bytes);
        Ok(Box::pin(async_stream::stream! {
            futures::pin_mut!(bytes);

            'read: while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        frames.extend(&chunk);
                        loop {
                            match frames.next_frame() {
                                Ok(Some(data)) => {
                                    if let Some(event) = decode_frame(&data) {
                                        yield Ok(event);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!("Agent event stream error: {}", e);
                                    yield Err(e);
                                    break 'read;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Agent event stream error: {}", e);
                        yield Err(RelayError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            tracing::debug!("Agent event stream ended");
        }))
    }

    async fn send_prompt(&self, endpoint: &str, conversation_id: &str, text: &str) -> Result<()> {
        let url = format!(
            "{}/session/{}/message",
            endpoint.trim_end_matches('/'),
            conversation_id
        );
        let body = json!({ "parts": [{ "type": "text", "text": text }] });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Prompt(e.into()))?;
        ensure_success(response).await.map_err(RelayError::Prompt)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_single_response_server(
        expected_path: &'static str,
        headers: &'static str,
        chunks: Vec<&'static str>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 8192];
            let n = socket.read(&mut buf).await.expect("read");
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            let first_line = req.lines().next().unwrap_or("").to_string();
            assert!(
                first_line.contains(expected_path),
                "expected path {}, got request line {}",
                expected_path,
                first_line
            );
            socket.write_all(headers.as_bytes()).await.expect("headers");
            for chunk in chunks {
                let framed = format!("{:x}\r\n{}\r\n", chunk.len(), chunk);
                socket.write_all(framed.as_bytes()).await.expect("chunk");
                socket.flush().await.expect("flush");
            }
            socket.write_all(b"0\r\n\r\n").await.expect("terminator");
            req
        });
        (format!("http://{}", addr), handle)
    }

    fn client() -> OpenCodeClient {
        OpenCodeClient::new(
            &HttpConfig::default(),
            &RelayConfig::default(),
            RetryPolicy::none(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn subscribe_reassembles_events_across_chunks() {
        let (base, server) = spawn_single_response_server(
            "GET /event",
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            vec![
                "data: {\"type\":\"server.connected\",\"properties\":{}}\n\ndata: {\"type\":\"message.part",
                ".updated\",\"properties\":{\"delta\":\"hi\"}}\n\n",
                ": ping\n\n",
            ],
        )
        .await;

        let mut stream = client().subscribe(&base).await.unwrap();
        let mut types = Vec::new();
        while let Some(event) = stream.next().await {
            types.push(event.unwrap().event_type);
        }
        assert_eq!(types, vec!["server.connected", "message.part.updated"]);
        let request = server.await.unwrap();
        assert!(request.to_ascii_lowercase().contains("accept: text/event-stream"));
    }

    #[tokio::test]
    async fn oversized_frame_ends_the_feed() {
        let (base, _server) = spawn_single_response_server(
            "GET /event",
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            vec![
                "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
                "data: {\"type\":\"message.part.updated\",\"properties\":{\"delta\":\"this frame never ends",
            ],
        )
        .await;
        let client = OpenCodeClient::new(
            &HttpConfig::default(),
            &RelayConfig {
                max_frame_bytes: 64,
                ..RelayConfig::default()
            },
            RetryPolicy::none(),
        )
        .unwrap();

        let mut stream = client.subscribe(&base).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().event_type, "server.connected");
        assert!(matches!(stream.next().await, Some(Err(RelayError::Stream(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_failure_is_typed() {
        let (base, _server) = spawn_single_response_server(
            "GET /event",
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            vec!["no such route"],
        )
        .await;
        let err = client().subscribe(&base).await.err().unwrap();
        assert!(matches!(
            err,
            RelayError::Subscribe(HttpError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn prompt_posts_text_part_to_conversation() {
        let (base, server) = spawn_single_response_server(
            "POST /session/ses_abc/message",
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            vec!["{}"],
        )
        .await;
        client().send_prompt(&base, "ses_abc", "fix the bug").await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /session/ses_abc/message"));
    }
}
