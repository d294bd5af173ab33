use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;

use skiff_types::{ErrorCode, NormalizedEvent};

use crate::client::AgentServerClient;
use crate::error::{RelayError, Result};
use crate::normalize::{failure_event, normalize, Normalized};
use crate::sse::RawAgentEvent;

/// One prompt/response exchange with the agent server.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub endpoint: String,
    pub conversation_id: String,
    pub content: String,
}

/// Produces the public event stream for one turn:
/// `session.running`, `message.user`, the normalized agent feed, then
/// `session.idle`. Any failure ends the stream with an `error` event instead.
///
/// The feed is subscribed before the prompt is submitted. The prompt runs on
/// its own task; if it fails the agent never starts a turn, so the stream
/// ends with a `STREAM_ERROR` instead of waiting for an idle that will not
/// come. A successful prompt leaves the feed in charge. The stream is lazy, so the
/// consumer's read rate paces upstream reads, and dropping it closes the
/// upstream connection.
pub fn relay_turn(
    client: Arc<dyn AgentServerClient>,
    request: TurnRequest,
) -> impl Stream<Item = NormalizedEvent> + Send + 'static {
    async_stream::stream! {
        yield NormalizedEvent::session_running(&request.session_id);
        yield NormalizedEvent::message_user(&request.content);

        let mut upstream = match client.subscribe(&request.endpoint).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!("Session {}: {}", request.session_id, e);
                yield NormalizedEvent::error(ErrorCode::StreamError, e.to_string());
                return;
            }
        };

        let (prompt_tx, mut prompt_rx) = oneshot::channel::<Result<()>>();
        let prompt_client = client.clone();
        let prompt = request.clone();
        tokio::spawn(async move {
            let outcome = prompt_client
                .send_prompt(&prompt.endpoint, &prompt.conversation_id, &prompt.content)
                .await;
            let _ = prompt_tx.send(outcome);
        });

        let mut prompt_pending = true;
        let mut connected = false;
        loop {
            let step = tokio::select! {
                outcome = &mut prompt_rx, if prompt_pending => Step::Prompt(outcome),
                item = upstream.next() => Step::Feed(item),
            };
            let raw = match step {
                Step::Prompt(Ok(Ok(()))) => {
                    prompt_pending = false;
                    tracing::debug!("Session {}: prompt call returned", request.session_id);
                    continue;
                }
                Step::Prompt(Ok(Err(e))) => {
                    tracing::warn!("Session {}: {}", request.session_id, e);
                    yield NormalizedEvent::error(ErrorCode::StreamError, e.to_string());
                    return;
                }
                Step::Prompt(Err(_)) => {
                    prompt_pending = false;
                    tracing::warn!("Session {}: prompt task ended without a result", request.session_id);
                    continue;
                }
                Step::Feed(None) => break,
                Step::Feed(Some(Ok(raw))) => raw,
                Step::Feed(Some(Err(e))) => {
                    yield NormalizedEvent::error(ErrorCode::StreamError, e.to_string());
                    return;
                }
            };
            match normalize(&raw, Some(request.conversation_id.as_str())) {
                Normalized::Emit(event) => yield event,
                Normalized::Connected => {
                    connected = true;
                    yield NormalizedEvent::server_connected();
                }
                Normalized::Idle if connected => {
                    yield NormalizedEvent::session_idle(&request.session_id);
                    return;
                }
                Normalized::Idle => {
                    tracing::debug!(
                        "Session {}: ignoring idle received before the feed connected",
                        request.session_id
                    );
                }
                Normalized::Failed(message) => yield failure_event(&message),
                Normalized::Drop => {}
            }
        }

        yield NormalizedEvent::error(
            ErrorCode::StreamError,
            "agent event stream ended before the turn completed",
        );
    }
}

enum Step {
    Prompt(std::result::Result<Result<()>, oneshot::error::RecvError>),
    Feed(Option<std::result::Result<RawAgentEvent, RelayError>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use skiff_types::EventType;

    use crate::client::RawEventStream;
    use crate::error::{RelayError, Result};
    use crate::sse::RawAgentEvent;

    struct RecordingClient {
        calls: Mutex<Vec<String>>,
        events: Vec<Result<RawAgentEvent>>,
        fail_subscribe: bool,
        fail_prompt: bool,
        hold_open: bool,
    }

    impl RecordingClient {
        fn new(events: Vec<RawAgentEvent>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                events: events.into_iter().map(Ok).collect(),
                fail_subscribe: false,
                fail_prompt: false,
                hold_open: false,
            })
        }
    }

    #[async_trait]
    impl AgentServerClient for RecordingClient {
        async fn subscribe(&self, endpoint: &str) -> Result<RawEventStream> {
            self.calls.lock().unwrap().push(format!("subscribe {}", endpoint));
            if self.fail_subscribe {
                return Err(RelayError::Stream("connection refused".to_string()));
            }
            let events: Vec<Result<RawAgentEvent>> = self
                .events
                .iter()
                .map(|e| match e {
                    Ok(event) => Ok(event.clone()),
                    Err(e) => Err(RelayError::Stream(e.to_string())),
                })
                .collect();
            let feed = futures::stream::iter(events);
            if self.hold_open {
                return Ok(Box::pin(feed.chain(futures::stream::pending())));
            }
            Ok(Box::pin(feed))
        }

        async fn send_prompt(&self, _endpoint: &str, conversation_id: &str, text: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("prompt {} {}", conversation_id, text));
            if self.fail_prompt {
                return Err(RelayError::Prompt(skiff_runtime::HttpError::Status {
                    status: 404,
                    body: "session not found".to_string(),
                }));
            }
            Ok(())
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            session_id: "s1".to_string(),
            endpoint: "https://agent.test".to_string(),
            conversation_id: "ses_a".to_string(),
            content: "hi".to_string(),
        }
    }

    fn raw(event_type: &str, properties: serde_json::Value) -> RawAgentEvent {
        RawAgentEvent::new(event_type, properties)
    }

    fn delta(text: &str) -> RawAgentEvent {
        raw(
            "message.part.updated",
            json!({"part": {"type": "text", "sessionID": "ses_a"}, "delta": text}),
        )
    }

    async fn collect(client: Arc<RecordingClient>) -> Vec<NormalizedEvent> {
        relay_turn(client, request()).collect().await
    }

    #[tokio::test]
    async fn subscribes_before_sending_prompt() {
        let client = RecordingClient::new(vec![
            raw("server.connected", json!({})),
            raw("session.idle", json!({"sessionID": "ses_a"})),
        ]);
        let _ = collect(client.clone()).await;
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if client.calls.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["subscribe https://agent.test".to_string(), "prompt ses_a hi".to_string()]
        );
    }

    #[tokio::test]
    async fn turn_is_framed_by_running_user_and_idle() {
        let client = RecordingClient::new(vec![
            raw("server.connected", json!({})),
            raw("server.heartbeat", json!({})),
            delta("Hel"),
            delta("lo"),
            raw("message.updated", json!({"info": {"id": "m"}})),
            raw("session.status", json!({"sessionID": "ses_a", "status": {"type": "idle"}})),
            delta("never delivered"),
        ]);
        let events = collect(client).await;
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::SessionRunning,
                EventType::MessageUser,
                EventType::ServerConnected,
                EventType::MessageAssistant,
                EventType::MessageAssistant,
                EventType::SessionIdle,
            ]
        );
        assert_eq!(events[1].content(), Some("hi"));
        assert_eq!(events[3].content(), Some("Hel"));
        assert_eq!(events[5].data["sessionId"], "s1");
    }

    #[tokio::test]
    async fn idle_before_connected_does_not_close() {
        let client = RecordingClient::new(vec![
            raw("session.idle", json!({"sessionID": "ses_a"})),
            delta("still here"),
            raw("server.connected", json!({})),
            raw("session.idle", json!({"sessionID": "ses_a"})),
        ]);
        let events = collect(client).await;
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::SessionIdle);
        assert!(events.iter().any(|e| e.content() == Some("still here")));
    }

    #[tokio::test]
    async fn feed_ending_without_idle_is_an_error() {
        let client = RecordingClient::new(vec![raw("server.connected", json!({})), delta("partial")]);
        let events = collect(client).await;
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::Error);
        assert_eq!(last.data["code"], "STREAM_ERROR");
    }

    #[tokio::test]
    async fn subscribe_failure_emits_error_and_never_prompts() {
        let client = Arc::new(RecordingClient {
            calls: Mutex::new(Vec::new()),
            events: Vec::new(),
            fail_subscribe: true,
            fail_prompt: false,
            hold_open: false,
        });
        let events = collect(client.clone()).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event_type, EventType::Error);
        tokio::task::yield_now().await;
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_prompt_ends_the_turn() {
        let client = Arc::new(RecordingClient {
            calls: Mutex::new(Vec::new()),
            events: vec![
                Ok(raw("server.connected", json!({}))),
                Ok(raw("server.heartbeat", json!({}))),
            ],
            fail_subscribe: false,
            fail_prompt: true,
            hold_open: true,
        });
        let events = tokio::time::timeout(std::time::Duration::from_secs(5), collect(client))
            .await
            .expect("relay must end once the prompt is rejected");
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::Error);
        assert_eq!(last.data["code"], "STREAM_ERROR");
        assert!(last.data["message"].as_str().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn accepted_prompt_leaves_the_feed_in_charge() {
        let client = RecordingClient::new(vec![
            raw("server.connected", json!({})),
            delta("done"),
            raw("session.idle", json!({"sessionID": "ses_a"})),
        ]);
        let events = collect(client).await;
        assert_eq!(events.last().unwrap().event_type, EventType::SessionIdle);
        assert!(events.iter().all(|e| e.event_type != EventType::Error));
    }

    #[tokio::test]
    async fn upstream_session_error_is_forwarded() {
        let client = RecordingClient::new(vec![
            raw("server.connected", json!({})),
            raw("session.error", json!({"sessionID": "ses_a", "error": {"name": "APIError", "data": {"message": "overloaded"}}})),
            raw("session.idle", json!({"sessionID": "ses_a"})),
        ]);
        let events = collect(client).await;
        let error = events
            .iter()
            .find(|e| e.event_type == EventType::Error)
            .unwrap();
        assert_eq!(error.data["message"], "overloaded");
        assert_eq!(events.last().unwrap().event_type, EventType::SessionIdle);
    }
}
