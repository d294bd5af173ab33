use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ErrorCode;

/// Public event vocabulary emitted on a message stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    #[serde(rename = "server.connected")]
    ServerConnected,
    #[serde(rename = "session.running")]
    SessionRunning,
    #[serde(rename = "message.user")]
    MessageUser,
    #[serde(rename = "message.assistant")]
    MessageAssistant,
    #[serde(rename = "message.tool")]
    MessageTool,
    #[serde(rename = "session.idle")]
    SessionIdle,
    #[serde(rename = "error")]
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ServerConnected => "server.connected",
            EventType::SessionRunning => "session.running",
            EventType::MessageUser => "message.user",
            EventType::MessageAssistant => "message.assistant",
            EventType::MessageTool => "message.tool",
            EventType::SessionIdle => "session.idle",
            EventType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Calling,
    Result,
}

/// `{type, data, timestamp}` as seen by callers. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn server_connected() -> Self {
        Self::new(EventType::ServerConnected, json!({}))
    }

    pub fn session_running(session_id: &str) -> Self {
        Self::new(EventType::SessionRunning, json!({ "sessionId": session_id }))
    }

    pub fn message_user(content: &str) -> Self {
        Self::new(EventType::MessageUser, json!({ "content": content }))
    }

    pub fn message_assistant(content: &str, is_partial: bool) -> Self {
        Self::new(
            EventType::MessageAssistant,
            json!({ "content": content, "isPartial": is_partial }),
        )
    }

    pub fn tool_calling(tool_name: &str, tool_id: &str, input: Value) -> Self {
        Self::new(
            EventType::MessageTool,
            json!({
                "toolName": tool_name,
                "toolId": tool_id,
                "status": ToolCallStatus::Calling,
                "input": input,
            }),
        )
    }

    pub fn tool_result(tool_name: &str, tool_id: &str, result: Value) -> Self {
        Self::new(
            EventType::MessageTool,
            json!({
                "toolName": tool_name,
                "toolId": tool_id,
                "status": ToolCallStatus::Result,
                "result": result,
            }),
        )
    }

    pub fn session_idle(session_id: &str) -> Self {
        Self::new(EventType::SessionIdle, json!({ "sessionId": session_id }))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Error,
            json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::SessionIdle | EventType::Error)
    }

    pub fn content(&self) -> Option<&str> {
        self.data.get("content").and_then(|v| v.as_str())
    }

    /// `data: <json>` framing, one event per line.
    pub fn to_sse_line(&self) -> String {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n", payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_event_serializes_public_shape() {
        let event = NormalizedEvent::message_assistant("hello", true);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message.assistant");
        assert_eq!(value["data"]["content"], "hello");
        assert_eq!(value["data"]["isPartial"], true);
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn tool_events_carry_status() {
        let calling = NormalizedEvent::tool_calling("bash", "call_1", json!({"cmd": "ls"}));
        assert_eq!(calling.data["status"], "calling");
        assert_eq!(calling.data["input"]["cmd"], "ls");

        let result = NormalizedEvent::tool_result("bash", "call_1", json!("ok"));
        assert_eq!(result.data["status"], "result");
        assert_eq!(result.data["result"], "ok");
    }

    #[test]
    fn error_event_uses_stable_code() {
        let event = NormalizedEvent::error(ErrorCode::StreamError, "upstream closed");
        assert!(event.is_terminal());
        assert_eq!(event.data["code"], "STREAM_ERROR");
        assert!(event.to_sse_line().starts_with("data: {"));
    }
}
