//! Data-line decoding.
//!
//! # Malformed lines
//!
//! Providers routinely split one JSON payload across two data lines, and
//! line framing cannot guarantee a decode boundary. A line that fails to
//! decode therefore produces [`StreamEvent::ParseError`], which callers must
//! treat as "no event for this line" and keep reading. The failure is logged
//! at `warn` and counted in [`EventParser::malformed_frames`] so a genuine
//! change in the upstream protocol does not go unnoticed.

use crate::events::{StreamEvent, DONE_SENTINEL};
use crate::frame::ProtocolLine;
use chatrelay_core::ErrorKind;
use serde_json::Value;

/// Turns data lines into [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct EventParser {
    malformed_frames: u64,
}

impl EventParser {
    /// Create a new parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one protocol line.
    ///
    /// Returns `None` for non-data lines and for payloads that carry no
    /// content.
    pub fn parse(&mut self, line: &ProtocolLine) -> Option<StreamEvent> {
        let payload = line.data_payload()?;
        self.parse_payload(payload)
    }

    /// Parse the payload of a data line (marker already stripped).
    pub fn parse_payload(&mut self, payload: &str) -> Option<StreamEvent> {
        if payload == DONE_SENTINEL {
            return Some(StreamEvent::Done);
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(json) => decode(&json),
            Err(e) => {
                self.malformed_frames += 1;
                tracing::warn!(
                    error = %e,
                    count = self.malformed_frames,
                    data = %payload,
                    "skipping undecodable stream line"
                );
                Some(StreamEvent::ParseError {
                    raw: payload.to_string(),
                })
            }
        }
    }

    /// Number of lines that failed to decode so far.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }
}

fn decode(json: &Value) -> Option<StreamEvent> {
    if let Some(error) = json.get("error") {
        return Some(decode_error(error));
    }

    if json.get("thinking").and_then(Value::as_bool) == Some(true) {
        return decode_thinking(json);
    }

    // Chat-completion chunk: choices[0].delta.content
    if let Some(choice) = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        let content = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)?;
        return non_empty(content).map(StreamEvent::content);
    }

    // Content-block delta: {"type":"content_block_delta","delta":{"text":...}}
    if json.get("type").and_then(Value::as_str) == Some("content_block_delta") {
        let text = json
            .get("delta")
            .and_then(|delta| delta.get("text"))
            .and_then(Value::as_str)?;
        return non_empty(text).map(StreamEvent::content);
    }

    None
}

fn decode_thinking(json: &Value) -> Option<StreamEvent> {
    let accumulated = || {
        json.get("accumulated")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    if json.get("started").and_then(Value::as_bool) == Some(true) {
        Some(StreamEvent::ThinkingStarted)
    } else if json.get("complete").and_then(Value::as_bool) == Some(true) {
        Some(StreamEvent::thinking_complete(accumulated()))
    } else {
        let delta = json.get("delta").and_then(Value::as_str)?;
        Some(StreamEvent::thinking_delta(delta, accumulated()))
    }
}

fn decode_error(error: &Value) -> StreamEvent {
    let kind = error
        .get("kind")
        .cloned()
        .and_then(|kind| serde_json::from_value::<ErrorKind>(kind).ok())
        .unwrap_or(ErrorKind::UnknownFailure);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| error.as_str().map(str::to_string))
        .unwrap_or_else(|| error.to_string());
    StreamEvent::error(kind, message)
}

fn non_empty(text: &str) -> Option<&str> {
    (!text.is_empty()).then_some(text)
}
