//! Raw agent server events to the public event vocabulary.

use serde_json::Value;

use skiff_types::{ErrorCode, NormalizedEvent};

use crate::sse::RawAgentEvent;

/// Outcome of normalizing one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Emit(NormalizedEvent),
    /// Feed is live. Arms idle detection.
    Connected,
    /// The agent finished its turn.
    Idle,
    /// The agent reported a failure for this conversation.
    Failed(String),
    Drop,
}

/// `conversation_id` scopes the feed: events naming another conversation are
/// dropped.
pub fn normalize(event: &RawAgentEvent, conversation_id: Option<&str>) -> Normalized {
    let props = &event.properties;
    let event_type = event.event_type.trim();

    if let (Some(expected), Some(actual)) = (conversation_id, event_session_id(event_type, props)) {
        if expected != actual {
            return Normalized::Drop;
        }
    }

    match event_type {
        "server.connected" => Normalized::Connected,
        "server.heartbeat" => Normalized::Drop,
        "session.idle" => Normalized::Idle,
        "session.status" => {
            let status = props
                .get("status")
                .and_then(|s| s.get("type").or(Some(s)))
                .and_then(|s| s.as_str());
            if status == Some("idle") {
                Normalized::Idle
            } else {
                Normalized::Drop
            }
        }
        "session.error" => Normalized::Failed(error_message(props.get("error"))),
        "message.part.updated" => normalize_part(props),
        "message.updated" | "session.updated" | "session.diff" | "session.compacted"
        | "file.edited" | "file.watcher.updated" | "todo.updated" => Normalized::Drop,
        other if other.starts_with("lsp.") || other.starts_with("server.") => Normalized::Drop,
        other => {
            tracing::debug!("Dropping unhandled agent event: {}", other);
            Normalized::Drop
        }
    }
}

fn event_session_id<'a>(event_type: &str, props: &'a Value) -> Option<&'a str> {
    props
        .get("part")
        .and_then(|p| p.get("sessionID"))
        .or_else(|| props.get("sessionID"))
        .or_else(|| props.get("info").and_then(|i| i.get("sessionID")))
        .or_else(|| {
            if event_type.starts_with("session.") {
                props.get("info").and_then(|i| i.get("id"))
            } else {
                None
            }
        })
        .and_then(|v| v.as_str())
}

fn normalize_part(props: &Value) -> Normalized {
    let Some(part) = props.get("part") else {
        return Normalized::Drop;
    };
    let role = props
        .get("message")
        .and_then(|m| m.get("role").or_else(|| m.get("info")?.get("role")))
        .and_then(|r| r.as_str());
    if role == Some("user") {
        return Normalized::Drop;
    }

    match part.get("type").and_then(|t| t.as_str()).unwrap_or("text") {
        "text" => normalize_text(props, part),
        "tool" | "tool-invocation" => normalize_tool(part),
        "reasoning" => Normalized::Drop,
        other => {
            tracing::debug!("Dropping message part of type {}", other);
            Normalized::Drop
        }
    }
}

fn normalize_text(props: &Value, part: &Value) -> Normalized {
    let delta = props
        .get("delta")
        .and_then(delta_text)
        .or_else(|| part.get("delta").and_then(delta_text));

    let (content, is_partial) = match delta {
        Some(delta) => (delta, true),
        None => {
            let started = part.get("time").and_then(|t| t.get("start")).is_some();
            if !started {
                return Normalized::Drop;
            }
            let text = part
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string();
            (text, false)
        }
    };

    if content.is_empty() {
        return Normalized::Drop;
    }
    Normalized::Emit(NormalizedEvent::message_assistant(&content, is_partial))
}

/// Deltas arrive as a string, an object with `text`, or an array of either.
fn delta_text(delta: &Value) -> Option<String> {
    match delta {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("text").and_then(|t| t.as_str()).map(String::from),
        Value::Array(items) => {
            let out: String = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(map) => map.get("text").and_then(|t| t.as_str()),
                    _ => None,
                })
                .collect();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        _ => None,
    }
}

fn normalize_tool(part: &Value) -> Normalized {
    let tool_name = part
        .get("tool")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown");
    let tool_id = part
        .get("callID")
        .or_else(|| part.get("id"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    let state = part.get("state");
    let status = state
        .and_then(|s| s.get("status"))
        .and_then(|s| s.as_str())
        .or_else(|| part.get("state").and_then(|s| s.as_str()))
        .unwrap_or("pending");

    match status {
        "pending" | "running" | "in_progress" => {
            let input = state
                .and_then(|s| s.get("input"))
                .or_else(|| part.get("args"))
                .cloned()
                .unwrap_or(Value::Null);
            Normalized::Emit(NormalizedEvent::tool_calling(tool_name, tool_id, input))
        }
        "completed" => {
            let result = state
                .and_then(|s| s.get("output"))
                .or_else(|| part.get("result"))
                .cloned()
                .unwrap_or(Value::Null);
            Normalized::Emit(NormalizedEvent::tool_result(tool_name, tool_id, result))
        }
        // A tool that ends any other way still ends; callers would otherwise
        // show it as running forever.
        "error" | "failed" | "cancelled" | "canceled" | "denied" | "aborted" | "timeout" => {
            let error = state
                .and_then(|s| s.get("error"))
                .cloned()
                .unwrap_or_else(|| Value::String(status.to_string()));
            Normalized::Emit(NormalizedEvent::tool_result(
                tool_name,
                tool_id,
                serde_json::json!({ "error": error }),
            ))
        }
        other => {
            tracing::debug!("Dropping tool part with status {}", other);
            Normalized::Drop
        }
    }
}

fn error_message(error: Option<&Value>) -> String {
    let Some(error) = error else {
        return "agent reported an error".to_string();
    };
    error
        .get("data")
        .and_then(|d| d.get("message"))
        .or_else(|| error.get("message"))
        .or_else(|| error.get("name"))
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .unwrap_or("agent reported an error")
        .to_string()
}

/// Converts a [`Normalized::Failed`] into its public event.
pub fn failure_event(message: &str) -> NormalizedEvent {
    NormalizedEvent::error(ErrorCode::StreamError, message)
}
