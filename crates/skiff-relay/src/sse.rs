use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

/// One event as emitted by the agent server's `/event` feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawAgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl RawAgentEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

/// Accumulates SSE bytes and splits them into frames. Frames end at a blank
/// line (`\n\n` or `\r\n\r\n`). Bytes already searched are not searched
/// again, and a pending frame larger than `max_frame_bytes` is an error.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    scanned: usize,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes: max_frame_bytes.max(1),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Removes the next complete frame and returns its joined `data:`
    /// payload. `Some("")` means a frame without data lines (comments,
    /// keep-alives).
    pub fn next_frame(&mut self) -> Result<Option<String>> {
        // A delimiter may straddle the previous scan boundary.
        let from = self.scanned.saturating_sub(3);
        let Some((end, delim_len)) = find_delimiter(&self.buffer[from..]) else {
            self.scanned = self.buffer.len();
            if self.buffer.len() > self.max_frame_bytes {
                return Err(RelayError::Stream(format!(
                    "event frame exceeds {} bytes",
                    self.max_frame_bytes
                )));
            }
            return Ok(None);
        };
        let end = from + end;
        if end > self.max_frame_bytes {
            return Err(RelayError::Stream(format!(
                "event frame exceeds {} bytes",
                self.max_frame_bytes
            )));
        }

        let frame: Vec<u8> = self.buffer.drain(..end + delim_len).take(end).collect();
        self.scanned = 0;
        let frame = String::from_utf8_lossy(&frame);

        let data_lines: Vec<&str> = frame
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            .collect();
        Ok(Some(data_lines.join("\n")))
    }
}

fn find_delimiter(bytes: &[u8]) -> Option<(usize, usize)> {
    let lf = find(bytes, b"\n\n").map(|i| (i, 2));
    let crlf = find(bytes, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 <= a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Decodes a frame payload. Empty and non-JSON payloads yield `None`.
pub fn decode_frame(data: &str) -> Option<RawAgentEvent> {
    if data.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<RawAgentEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(
                "Dropping undecodable agent event: {} - data: {}",
                e,
                data.chars().take(200).collect::<String>()
            );
            None
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> FrameBuffer {
        let mut buffer = FrameBuffer::new(1024);
        buffer.extend(bytes);
        buffer
    }

    #[test]
    fn parses_frames_with_optional_space_and_crlf() {
        let mut buffer = buffer_with(b"data:{\"type\":\"server.connected\",\"properties\":{}}\r\n\r\ndata: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"s\"}}\n\npartial");

        let first = decode_frame(&buffer.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(first.event_type, "server.connected");
        let second = decode_frame(&buffer.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(second.event_type, "session.idle");
        assert_eq!(second.properties["sessionID"], "s");
        assert!(buffer.next_frame().unwrap().is_none());
        assert_eq!(buffer.pending(), b"partial");
    }

    #[test]
    fn joins_multiline_data_and_skips_comment_frames() {
        let mut buffer = buffer_with(
            b": keep-alive\n\nevent: message\ndata: {\"type\":\"x\",\ndata: \"properties\":{}}\n\n",
        );
        assert_eq!(buffer.next_frame().unwrap().as_deref(), Some(""));
        let data = buffer.next_frame().unwrap().unwrap();
        assert_eq!(data, "{\"type\":\"x\",\n\"properties\":{}}");
        assert_eq!(decode_frame(&data).unwrap().event_type, "x");
    }

    #[test]
    fn multibyte_text_split_across_chunks_survives() {
        let full = "data: {\"type\":\"t\",\"properties\":{\"text\":\"héllo\"}}\n\n".as_bytes();
        let split = full.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut buffer = buffer_with(&full[..split]);
        assert!(buffer.next_frame().unwrap().is_none());
        buffer.extend(&full[split..]);
        let event = decode_frame(&buffer.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(event.properties["text"], "héllo");
    }

    #[test]
    fn delimiter_split_across_chunks_is_found() {
        let mut buffer = buffer_with(b"data: {\"type\":\"a\",\"properties\":{}}\r\n\r");
        assert!(buffer.next_frame().unwrap().is_none());
        buffer.extend(b"\ndata: tail");
        let event = decode_frame(&buffer.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(event.event_type, "a");
        assert_eq!(buffer.pending(), b"data: tail");
    }

    #[test]
    fn unterminated_frame_over_the_limit_is_an_error() {
        let mut buffer = FrameBuffer::new(16);
        buffer.extend(b"data: 0123456789");
        assert!(buffer.next_frame().unwrap().is_none());
        buffer.extend(b"abcdef");
        assert!(matches!(buffer.next_frame(), Err(RelayError::Stream(_))));
    }

    #[test]
    fn non_json_payloads_are_dropped() {
        assert!(decode_frame("[DONE]").is_none());
        assert!(decode_frame("   ").is_none());
    }
}
