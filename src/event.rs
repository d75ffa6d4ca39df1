//! Stream event parsing
//!
//! Turns [`RawFrame`]s into [`RawStreamEvent`]s. The event type carries no
//! strong schema: every accessor reads lazily from the decoded JSON object,
//! because the wire protocol keeps adding event kinds and fields.
//!
//! Per frame:
//!
//! 1. The payload is trimmed; an empty payload yields nothing.
//! 2. `[DONE]` yields a synthetic `done` event with empty data.
//! 3. Anything else is decoded as a JSON object. A frame that fails to decode
//!    yields a synthetic `error` event and the stream carries on.
//! 4. The type is the SSE `event:` name, else the `type` field, else the
//!    `event` field, else `message`.

use crate::Result;
use crate::error::ApiErrorBody;
use crate::transport::RawFrame;
use crate::types::{Response, ResponseStatus};
use futures::stream::{Stream, StreamExt};
use serde_json::{Map, Value};

/// Payload of the legacy end-of-stream marker
pub const DONE_SENTINEL: &str = "[DONE]";

/// Type of the event synthesized for `[DONE]`
pub const DONE_EVENT: &str = "done";

/// Type of the event synthesized for an undecodable frame
pub const ERROR_EVENT: &str = "error";

/// Message carried by the synthetic `error` event
pub const CHUNK_DECODING_FAILED: &str = "chunk_decoding_failed";

const FALLBACK_EVENT: &str = "message";

/// One typed event decoded from the stream
#[derive(Debug, Clone, PartialEq)]
pub struct RawStreamEvent {
    pub kind: String,
    pub data: Map<String, Value>,
}

impl RawStreamEvent {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Builds an event from a JSON object literal; non-objects give empty data.
    pub fn from_value(kind: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(kind, data)
    }

    fn done() -> Self {
        Self::new(DONE_EVENT, Map::new())
    }

    fn decoding_failed() -> Self {
        let mut data = Map::new();
        data.insert("type".to_string(), Value::from(ERROR_EVENT));
        data.insert("message".to_string(), Value::from(CHUNK_DECODING_FAILED));
        Self::new(ERROR_EVENT, data)
    }

    /// String field of the event payload
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Nested `item` object, as sent with output-item and tool events
    pub fn item(&self) -> Option<&Map<String, Value>> {
        self.data.get("item").and_then(Value::as_object)
    }

    /// `status` of the event, falling back to the embedded response's status
    pub fn status(&self) -> Option<ResponseStatus> {
        let raw = self.str_field("status").or_else(|| {
            self.data
                .get("response")
                .and_then(|r| r.get("status"))
                .and_then(Value::as_str)
        })?;
        serde_json::from_value(Value::from(raw)).ok()
    }

    /// `response_id`, else `id`
    pub fn response_id(&self) -> Option<&str> {
        self.str_field("response_id")
            .or_else(|| self.str_field("id"))
            .filter(|id| !id.is_empty())
    }

    /// Text carried by a delta event.
    ///
    /// Accepts a string `delta`, an object `delta` with `text` or
    /// `output_text`, or a top-level `text` field.
    pub fn delta_text(&self) -> Option<&str> {
        match self.data.get("delta") {
            Some(Value::String(text)) => return Some(text),
            Some(Value::Object(delta)) => {
                let text = delta
                    .get("text")
                    .or_else(|| delta.get("output_text"))
                    .and_then(Value::as_str);
                if text.is_some() {
                    return text;
                }
            }
            _ => {}
        }
        self.str_field("text")
    }

    /// Embedded `response` object, decoded leniently
    pub fn response(&self) -> Option<Response> {
        let value = self.data.get("response")?;
        if !value.is_object() {
            return None;
        }
        match serde_json::from_value(value.clone()) {
            Ok(response) => Some(response),
            Err(e) => {
                log::debug!("ignoring undecodable response in {} event: {}", self.kind, e);
                None
            }
        }
    }

    /// Embedded `error` object
    pub fn error(&self) -> Option<ApiErrorBody> {
        let value = self.data.get("error")?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Parses a single frame. Returns `None` for frames that carry no event.
pub fn parse_frame(frame: &RawFrame) -> Option<RawStreamEvent> {
    let payload = frame.data.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(RawStreamEvent::done());
    }

    let data = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            log::warn!("stream frame is not a JSON object: {}", other);
            return Some(RawStreamEvent::decoding_failed());
        }
        Err(e) => {
            log::warn!("failed to decode stream frame: {}", e);
            return Some(RawStreamEvent::decoding_failed());
        }
    };

    let kind = frame
        .event
        .as_deref()
        .filter(|name| !name.is_empty())
        .or_else(|| data.get("type").and_then(Value::as_str))
        .or_else(|| data.get("event").and_then(Value::as_str))
        .unwrap_or(FALLBACK_EVENT)
        .to_string();

    log::trace!("stream event {}", kind);
    Some(RawStreamEvent { kind, data })
}

/// Maps a frame sequence onto an event sequence.
///
/// Transport errors pass through unchanged; undecodable frames become
/// in-band `error` events.
pub fn parse_events<S>(frames: S) -> impl Stream<Item = Result<RawStreamEvent>>
where
    S: Stream<Item = Result<RawFrame>>,
{
    frames.filter_map(|frame| async move {
        match frame {
            Ok(frame) => parse_frame(&frame).map(Ok),
            Err(e) => Some(Err(e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use futures::stream;
    use serde_json::json;

    fn frame(data: &str) -> RawFrame {
        RawFrame::new(data)
    }

    #[test]
    fn test_empty_payload_is_dropped() {
        assert!(parse_frame(&frame("")).is_none());
        assert!(parse_frame(&frame("   \n\t ")).is_none());
    }

    #[test]
    fn test_done_sentinel() {
        let event = parse_frame(&frame("  [DONE] ")).unwrap();
        assert_eq!(event.kind, "done");
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_malformed_frame_becomes_error_event() {
        let event = parse_frame(&frame("{not json")).unwrap();
        assert_eq!(event.kind, "error");
        assert_eq!(event.str_field("message"), Some(CHUNK_DECODING_FAILED));

        let event = parse_frame(&frame("[1, 2, 3]")).unwrap();
        assert_eq!(event.kind, "error");
    }

    #[test]
    fn test_type_precedence() {
        let payload = r#"{"type": "from_type", "event": "from_event"}"#;

        let named = RawFrame::named("from_sse", payload);
        assert_eq!(parse_frame(&named).unwrap().kind, "from_sse");

        assert_eq!(parse_frame(&frame(payload)).unwrap().kind, "from_type");

        let event_only = frame(r#"{"event": "from_event"}"#);
        assert_eq!(parse_frame(&event_only).unwrap().kind, "from_event");

        let bare = frame(r#"{"value": 1}"#);
        assert_eq!(parse_frame(&bare).unwrap().kind, "message");
    }

    #[test]
    fn test_delta_text_forms() {
        let flat = RawStreamEvent::from_value("d", json!({"delta": " world"}));
        assert_eq!(flat.delta_text(), Some(" world"));

        let nested = RawStreamEvent::from_value("d", json!({"delta": {"text": "a"}}));
        assert_eq!(nested.delta_text(), Some("a"));

        let output = RawStreamEvent::from_value("d", json!({"delta": {"output_text": "b"}}));
        assert_eq!(output.delta_text(), Some("b"));

        let top = RawStreamEvent::from_value("d", json!({"text": "c"}));
        assert_eq!(top.delta_text(), Some("c"));

        let none = RawStreamEvent::from_value("d", json!({"delta": 3}));
        assert_eq!(none.delta_text(), None);
    }

    #[test]
    fn test_response_accessors() {
        let event = RawStreamEvent::from_value(
            "response.completed",
            json!({
                "type": "response.completed",
                "response": {"id": "resp_1", "status": "completed", "created_at": 10, "output": []}
            }),
        );
        let response = event.response().unwrap();
        assert_eq!(response.id, "resp_1");
        assert_eq!(event.status(), Some(ResponseStatus::Completed));
        assert_eq!(event.response_id(), None);

        let bare = RawStreamEvent::from_value("x", json!({"response_id": "resp_2", "id": "item_1"}));
        assert_eq!(bare.response_id(), Some("resp_2"));

        let by_id = RawStreamEvent::from_value("x", json!({"id": "resp_3"}));
        assert_eq!(by_id.response_id(), Some("resp_3"));
    }

    #[test]
    fn test_error_accessor_requires_object() {
        let event = RawStreamEvent::from_value(
            "response.error",
            json!({"error": {"message": "quota exceeded", "code": "insufficient_quota"}}),
        );
        let error = event.error().unwrap();
        assert_eq!(error.message.as_deref(), Some("quota exceeded"));

        let flat = RawStreamEvent::from_value("x", json!({"error": "boom"}));
        assert!(flat.error().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_drop_neighbours() {
        let frames = stream::iter(vec![
            Ok(frame(r#"{"type":"response.output_text.delta","delta":"Hel"}"#)),
            Ok(frame("{oops")),
            Ok(frame(r#"{"type":"response.output_text.delta","delta":"lo"}"#)),
        ]);

        let events: Vec<_> = parse_events(frames).collect().await;
        assert_eq!(events.len(), 3);
        let kinds: Vec<_> = events
            .iter()
            .map(|e| e.as_ref().unwrap().kind.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "response.output_text.delta",
                "error",
                "response.output_text.delta"
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_passes_through() {
        let frames = stream::iter(vec![
            Ok(frame(r#"{"type":"response.created"}"#)),
            Err(Error::stream_decoding("connection reset")),
        ]);

        let events: Vec<_> = parse_events(frames).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(Error::StreamDecoding(_))));
    }
}
