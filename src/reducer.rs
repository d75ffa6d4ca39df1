//! Folding stream events into conversation snapshots
//!
//! [`reduce`] is a pure function: it takes the current snapshot and one
//! event and returns the next snapshot. It never blocks and performs no I/O,
//! so the whole state machine can be exercised without a network.
//!
//! # Dispatch
//!
//! ```text
//! RawStreamEvent
//!     │
//!     │ 1. metadata merge      (embedded response or bare response id)
//!     ▼
//!     │ 2. response phase      (exact event types: response.created, ...)
//!     ▼
//!     │ 3. sub-phases          (prefix routing + suffix classification)
//!     ▼
//! ConversationStateSnapshot
//! ```
//!
//! Sub-phase events are routed by prefix to the web search, file search,
//! reasoning or tool call machine, then classified by the suffix rules in
//! [`STAGE_RULES`]; the first rule that matches wins.

use crate::conversation::{
    ConversationMessage, ConversationStateSnapshot, FileSearchPhase, MessageRole, ReasoningPhase,
    ResponsePhase, ToolCallPhase, WebSearchPhase, unix_now,
};
use crate::event::{CHUNK_DECODING_FAILED, DONE_EVENT, ERROR_EVENT, RawStreamEvent};
use crate::types::Response;
use serde_json::{Map, Value};

const UNKNOWN_ERROR: &str = "Unknown error";

const WEB_SEARCH_PREFIX: &str = "response.web_search_call";
const FILE_SEARCH_PREFIX: &str = "response.file_search_call";
const REASONING_PREFIX: &str = "response.reasoning";
const TOOL_CALL_PREFIXES: [&str; 2] = ["response.tool_call", "response.code_interpreter_call"];
const OUTPUT_ITEM_PREFIX: &str = "response.output_item";

const TOOL_ITEM_TYPES: [&str; 2] = ["tool_call", "code_interpreter_call"];
const TOOL_OUTPUT_MARKER: &str = ".output";

/// Coarse progress stage shared by every sub-phase machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Failed,
    Completed,
    InProgress,
    Initial,
}

/// Suffix markers for each stage, in priority order
pub const STAGE_RULES: &[(Stage, &[&str])] = &[
    (Stage::Failed, &[".failed", ".error", ".cancelled"]),
    (Stage::Completed, &[".completed", ".done", ".finished"]),
    (Stage::InProgress, &[".delta", ".in_progress", ".progress"]),
    (Stage::Initial, &[".created", ".added", ".started"]),
];

/// Classifies an event type by the first matching rule in [`STAGE_RULES`].
pub fn classify(event_type: &str) -> Option<Stage> {
    STAGE_RULES
        .iter()
        .find(|(_, markers)| markers.iter().any(|marker| event_type.contains(marker)))
        .map(|(stage, _)| *stage)
}

/// Folds one event into `snapshot`, returning the next snapshot.
pub fn reduce(
    snapshot: &ConversationStateSnapshot,
    event: &RawStreamEvent,
) -> ConversationStateSnapshot {
    let mut next = snapshot.clone();
    let response = event.response();

    match &response {
        Some(response) => apply_metadata(&mut next, response),
        None => {
            if let Some(id) = event.response_id() {
                next.last_response_id = Some(id.to_string());
            }
        }
    }

    match event.kind.as_str() {
        "response.created" => next.response_phase = ResponsePhase::AwaitingResponse,
        "response.in_progress" => next.response_phase = ResponsePhase::Streaming,
        "response.output_text.delta" => {
            if let Some(text) = event.delta_text().filter(|text| !text.is_empty()) {
                next.response_phase = ResponsePhase::Streaming;
                append_assistant_text(&mut next.messages, text);
            }
        }
        "response.output_text.done" => {
            if let Some(response) = &response {
                next.messages = merge_response(&next.messages, response);
            }
        }
        "response.completed" => {
            next.response_phase = ResponsePhase::Completed;
            if let Some(response) = &response {
                next.messages = merge_response(&next.messages, response);
                apply_metadata(&mut next, response);
            }
        }
        "response.error" => {
            next.response_phase = ResponsePhase::Failed(error_message(event, response.as_ref()));
        }
        "response.failed" => {
            next.response_phase = ResponsePhase::Failed(error_message(event, response.as_ref()));
            if let Some(response) = &response {
                next.messages = merge_response(&next.messages, response);
            }
        }
        "response.incomplete" => {
            if response.as_ref().and_then(|r| r.error.as_ref()).is_some() || event.error().is_some()
            {
                next.response_phase =
                    ResponsePhase::Failed(error_message(event, response.as_ref()));
            }
        }
        DONE_EVENT => {
            if next.response_phase == ResponsePhase::Streaming {
                next.response_phase = ResponsePhase::Completed;
            }
        }
        ERROR_EVENT => {
            // The parser's own marker for a malformed frame is not a server failure
            let flat = event
                .str_field("message")
                .filter(|message| *message != CHUNK_DECODING_FAILED);
            if let Some(error) = event.error() {
                next.response_phase = ResponsePhase::Failed(
                    error.message.unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                );
            } else if let Some(message) = flat {
                let message = if message.is_empty() { UNKNOWN_ERROR } else { message };
                next.response_phase = ResponsePhase::Failed(message.to_string());
            }
        }
        other => {
            if !update_sub_phases(&mut next, other, event) {
                if let Some(error) = event.error() {
                    let message = error.message.unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                    next.response_phase = ResponsePhase::Failed(message);
                }
            }
        }
    }

    next
}

pub(crate) fn apply_metadata(snapshot: &mut ConversationStateSnapshot, response: &Response) {
    snapshot.last_response_id = Some(response.id.clone());
    if let Some(conversation_id) = response
        .conversation_id
        .as_ref()
        .filter(|id| !id.is_empty())
    {
        snapshot.conversation_id = Some(conversation_id.clone());
    }
    if response.created_at > 0 {
        snapshot.created_at = snapshot.created_at.max(Some(response.created_at));
    }
    snapshot.metadata = response.metadata.clone();
}

fn error_message(event: &RawStreamEvent, response: Option<&Response>) -> String {
    event
        .error()
        .or_else(|| response.and_then(|r| r.error.clone()))
        .and_then(|error| error.message)
        .unwrap_or_else(|| UNKNOWN_ERROR.to_string())
}

/// Replaces the in-progress partial with the response's authoritative output.
///
/// Each output item becomes one message; items without a usable role or
/// without text are skipped. When the transcript ends with a message of the
/// same role as the first output message, that trailing message is the
/// partial being superseded and is dropped.
pub fn merge_response(
    messages: &[ConversationMessage],
    response: &Response,
) -> Vec<ConversationMessage> {
    let created_at = if response.created_at > 0 {
        response.created_at
    } else {
        unix_now()
    };

    let aggregated: Vec<ConversationMessage> = response
        .output
        .iter()
        .filter_map(|item| {
            let role = item.role.and_then(MessageRole::from_wire)?;
            let text = item.text();
            if text.is_empty() {
                return None;
            }
            let mut message = ConversationMessage::new(role, text);
            if !item.id.is_empty() {
                message.id = item.id.clone();
            }
            message.created_at = created_at;
            Some(message)
        })
        .collect();

    let mut merged = messages.to_vec();
    let Some(first) = aggregated.first() else {
        return merged;
    };
    if merged.last().is_some_and(|last| last.role == first.role) {
        merged.pop();
    }
    merged.extend(aggregated);
    merged
}

fn append_assistant_text(messages: &mut Vec<ConversationMessage>, text: &str) {
    match messages.last_mut() {
        Some(last) if last.role == MessageRole::Assistant => {
            last.text.push_str(text);
            last.created_at = unix_now();
        }
        _ => messages.push(ConversationMessage::assistant(text)),
    }
}

/// Routes a sub-phase event. Returns `false` if no sub-phase claimed it.
fn update_sub_phases(
    snapshot: &mut ConversationStateSnapshot,
    kind: &str,
    event: &RawStreamEvent,
) -> bool {
    let data = &event.data;

    if kind.starts_with(WEB_SEARCH_PREFIX) {
        snapshot.web_search_phase = web_search_phase(&snapshot.web_search_phase, kind, data);
        true
    } else if kind.starts_with(FILE_SEARCH_PREFIX) {
        snapshot.file_search_phase = file_search_phase(&snapshot.file_search_phase, kind, data);
        true
    } else if kind.starts_with(REASONING_PREFIX) {
        snapshot.reasoning_phase =
            reasoning_phase(&snapshot.reasoning_phase, kind, data, event.item());
        true
    } else if TOOL_CALL_PREFIXES.iter().any(|p| kind.starts_with(p)) {
        snapshot.tool_call_phase =
            tool_call_phase(&snapshot.tool_call_phase, kind, data, event.item());
        true
    } else if kind.starts_with(OUTPUT_ITEM_PREFIX) {
        let Some(item) = event.item() else {
            return true;
        };
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if item_type.starts_with("reasoning") {
            snapshot.reasoning_phase =
                reasoning_phase(&snapshot.reasoning_phase, kind, data, Some(item));
        } else if TOOL_ITEM_TYPES.contains(&item_type) {
            snapshot.tool_call_phase =
                tool_call_phase(&snapshot.tool_call_phase, kind, data, Some(item));
        }
        true
    } else {
        false
    }
}

fn web_search_phase(current: &WebSearchPhase, kind: &str, data: &Map<String, Value>) -> WebSearchPhase {
    match classify(kind) {
        Some(Stage::Failed) => WebSearchPhase::Failed {
            reason: failure_reason(data, None),
        },
        Some(Stage::Completed) => WebSearchPhase::Completed,
        Some(Stage::InProgress) => WebSearchPhase::Searching,
        Some(Stage::Initial) => WebSearchPhase::Initiated {
            query: non_empty_str(data, "query"),
        },
        None => current.clone(),
    }
}

fn file_search_phase(
    current: &FileSearchPhase,
    kind: &str,
    data: &Map<String, Value>,
) -> FileSearchPhase {
    match classify(kind) {
        Some(Stage::Failed) => FileSearchPhase::Failed {
            reason: failure_reason(data, None),
        },
        Some(Stage::Completed) => FileSearchPhase::Completed,
        Some(Stage::InProgress) => FileSearchPhase::Searching,
        Some(Stage::Initial) => FileSearchPhase::Preparing,
        None => current.clone(),
    }
}

fn reasoning_phase(
    current: &ReasoningPhase,
    kind: &str,
    data: &Map<String, Value>,
    item: Option<&Map<String, Value>>,
) -> ReasoningPhase {
    match classify(kind) {
        Some(Stage::Failed) => ReasoningPhase::Failed {
            reason: failure_reason(data, item),
        },
        Some(Stage::Completed) => ReasoningPhase::Completed {
            summary: reasoning_summary(data, item),
        },
        Some(Stage::InProgress) => ReasoningPhase::Reasoning,
        Some(Stage::Initial) => ReasoningPhase::Drafting,
        None => current.clone(),
    }
}

fn tool_call_phase(
    current: &ToolCallPhase,
    kind: &str,
    data: &Map<String, Value>,
    item: Option<&Map<String, Value>>,
) -> ToolCallPhase {
    let name = item_or_outer(data, item, "name");
    let tool_kind = item_or_outer(data, item, "type");

    match classify(kind) {
        Some(Stage::Failed) => ToolCallPhase::Failed {
            name,
            kind: tool_kind,
            reason: failure_reason(data, item),
        },
        Some(Stage::Completed) => ToolCallPhase::Completed {
            name,
            kind: tool_kind,
        },
        Some(Stage::InProgress) | Some(Stage::Initial) => ToolCallPhase::Running {
            name,
            kind: tool_kind,
        },
        None if kind.contains(TOOL_OUTPUT_MARKER) => ToolCallPhase::AwaitingOutput {
            name,
            kind: tool_kind,
        },
        None => current.clone(),
    }
}

fn non_empty_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Item-level field, falling back to the outer event's field.
fn item_or_outer(
    data: &Map<String, Value>,
    item: Option<&Map<String, Value>>,
    key: &str,
) -> Option<String> {
    item.and_then(|item| non_empty_str(item, key))
        .or_else(|| non_empty_str(data, key))
}

fn failure_reason(data: &Map<String, Value>, item: Option<&Map<String, Value>>) -> Option<String> {
    let error = item
        .and_then(|item| item.get("error"))
        .or_else(|| data.get("error"));

    match error {
        Some(Value::Object(error)) => {
            let reason = non_empty_str(error, "message").or_else(|| non_empty_str(error, "reason"));
            if reason.is_some() {
                return reason;
            }
        }
        Some(Value::String(reason)) if !reason.is_empty() => return Some(reason.clone()),
        _ => {}
    }

    item.and_then(|item| non_empty_str(item, "message"))
        .or_else(|| non_empty_str(data, "message"))
}

fn reasoning_summary(data: &Map<String, Value>, item: Option<&Map<String, Value>>) -> Option<String> {
    let summary = item
        .and_then(|item| item.get("summary"))
        .or_else(|| data.get("summary"));

    let from_summary = match summary {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(entries)) => entries.iter().find_map(|entry| match entry {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            Value::Object(entry) => non_empty_str(entry, "text"),
            _ => None,
        }),
        Some(Value::Object(summary)) => non_empty_str(summary, "text"),
        _ => None,
    };

    from_summary.or_else(|| {
        item.and_then(|item| non_empty_str(item, "text"))
            .or_else(|| non_empty_str(data, "text"))
    })
}
