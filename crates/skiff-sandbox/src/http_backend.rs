use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use skiff_runtime::{
    build_http_client, ensure_success, read_json, retry, HttpConfig, HttpError, RetryPolicy,
};

use crate::backend::{ComputeBackend, ExecOutput, UnitInfo, UnitSpec};

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    url: String,
}

/// [`ComputeBackend`] speaking JSON to a sandbox controller service.
pub struct HttpComputeBackend {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpComputeBackend {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        http: &HttpConfig,
        retry: RetryPolicy,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            client: build_http_client(http, token)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ComputeBackend for HttpComputeBackend {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<UnitInfo, HttpError> {
        let url = self.url("/sandboxes");
        let (client, url) = (&self.client, url.as_str());
        retry(&self.retry, "sandbox.create_unit", || async move {
            let response = client.post(url).json(spec).send().await?;
            read_json::<UnitInfo>(response).await
        })
        .await
    }

    async fn exec(&self, unit_id: &str, argv: &[String]) -> Result<ExecOutput, HttpError> {
        let url = self.url(&format!("/sandboxes/{}/exec", unit_id));
        let body = json!({ "argv": argv });
        let (client, url, body) = (&self.client, url.as_str(), &body);
        retry(&self.retry, "sandbox.exec", || async move {
            let response = client.post(url).json(body).send().await?;
            read_json::<ExecOutput>(response).await
        })
        .await
    }

    async fn tunnel_url(&self, unit_id: &str, port: u16) -> Result<String, HttpError> {
        let url = self.url(&format!("/sandboxes/{}/tunnels", unit_id));
        let (client, url) = (&self.client, url.as_str());
        let tunnels: HashMap<String, TunnelInfo> =
            retry(&self.retry, "sandbox.tunnels", || async move {
                let response = client.get(url).send().await?;
                read_json(response).await
            })
            .await?;
        tunnels
            .get(&port.to_string())
            .map(|t| t.url.trim_end_matches('/').to_string())
            .ok_or_else(|| HttpError::Decode(format!("no tunnel exposed for port {}", port)))
    }

    async fn stop_unit(&self, unit_id: &str) -> Result<(), HttpError> {
        let url = self.url(&format!("/sandboxes/{}/stop", unit_id));
        let (client, url) = (&self.client, url.as_str());
        retry(&self.retry, "sandbox.stop_unit", || async move {
            let response = client.post(url).send().await?;
            ensure_success(response).await.map(|_| ())
        })
        .await
    }

    async fn start_unit(&self, unit_id: &str) -> Result<(), HttpError> {
        let url = self.url(&format!("/sandboxes/{}/start", unit_id));
        let (client, url) = (&self.client, url.as_str());
        retry(&self.retry, "sandbox.start_unit", || async move {
            let response = client.post(url).send().await?;
            ensure_success(response).await.map(|_| ())
        })
        .await
    }

    async fn delete_unit(&self, unit_id: &str) -> Result<(), HttpError> {
        let url = self.url(&format!("/sandboxes/{}", unit_id));
        // Deletion is idempotent on the controller side; a failed attempt is
        // reported, not repeated.
        let (client, url) = (&self.client, url.as_str());
        let result = retry(&RetryPolicy::none(), "sandbox.delete_unit", || async move {
            let response = client.delete(url).send().await?;
            ensure_success(response).await.map(|_| ())
        })
        .await;
        match result {
            Err(HttpError::Status { status: 404, .. }) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers each connection with the next canned `(status, body)` pair and
    /// records the request lines it saw.
    async fn spawn_scripted_server(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, Arc<tokio::sync::Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let seen_task = seen.clone();
        let hits_task = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let req = read_request(&mut socket).await;
                seen_task.lock().await.push(req);
                hits_task.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{}", addr), seen, hits)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn exec_posts_argv_with_bearer_token() {
        let (base, seen, _) = spawn_scripted_server(vec![(
            "200 OK",
            r#"{"exitCode":0,"stdout":"hello\n","stderr":""}"#,
        )])
        .await;
        let backend =
            HttpComputeBackend::new(&base, Some("ctl-token"), &HttpConfig::default(), fast_retry())
                .unwrap();

        let out = backend
            .exec("sb-1", &["echo".to_string(), "hello".to_string()])
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
        let requests = seen.lock().await;
        assert!(requests[0].starts_with("POST /sandboxes/sb-1/exec"));
        assert!(requests[0]
            .to_ascii_lowercase()
            .contains("authorization: bearer ctl-token"));
        assert!(requests[0].contains(r#""argv":["echo","hello"]"#));
    }

    #[tokio::test]
    async fn create_unit_retries_server_errors() {
        let (base, _, hits) = spawn_scripted_server(vec![
            ("503 Service Unavailable", r#"{"error":"busy"}"#),
            ("200 OK", r#"{"id":"sb-42"}"#),
        ])
        .await;
        let backend =
            HttpComputeBackend::new(&base, None, &HttpConfig::default(), fast_retry()).unwrap();
        let spec = UnitSpec {
            image: "skiff/agent:latest".to_string(),
            env: Default::default(),
            encrypted_ports: vec![4096],
            cpu: 1.0,
            memory_mb: 2048,
            timeout_secs: 3600,
            idle_timeout_secs: 600,
        };

        let unit = backend.create_unit(&spec).await.unwrap();
        assert_eq!(unit.id, "sb-42");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delete_is_single_attempt_and_tolerates_missing_units() {
        let (base, _, hits) =
            spawn_scripted_server(vec![("404 Not Found", r#"{"error":"gone"}"#)]).await;
        let backend =
            HttpComputeBackend::new(&base, None, &HttpConfig::default(), fast_retry()).unwrap();
        backend.delete_unit("sb-gone").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (base, _, hits) =
            spawn_scripted_server(vec![("500 Internal Server Error", "{}"), ("200 OK", "{}")])
                .await;
        let backend =
            HttpComputeBackend::new(&base, None, &HttpConfig::default(), fast_retry()).unwrap();
        assert!(backend.delete_unit("sb-1").await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tunnel_url_picks_requested_port() {
        let (base, _, _) = spawn_scripted_server(vec![(
            "200 OK",
            r#"{"4096":{"url":"https://abc.tunnel.example/"},"22":{"url":"https://ssh"}}"#,
        )])
        .await;
        let backend =
            HttpComputeBackend::new(&base, None, &HttpConfig::default(), fast_retry()).unwrap();
        let url = backend.tunnel_url("sb-1", 4096).await.unwrap();
        assert_eq!(url, "https://abc.tunnel.example");
    }
}
