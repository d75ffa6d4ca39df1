//! Wire-level types for the Responses API
//!
//! Decoding is deliberately lenient: unknown fields are ignored, most fields
//! are optional, and unknown enum strings decode into an `Other`/`Unknown`
//! variant instead of failing the whole object. The stream protocol is
//! extensible and a new field must never break an in-flight conversation.

use crate::error::ApiErrorBody;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Error object embedded in a response or stream event
pub type ResponseError = ApiErrorBody;

/// Lifecycle status reported by the service for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Queued,
    InProgress,
    Completed,
    Incomplete,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// Author of an input or output item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
    Tool,
    Developer,
    #[serde(other)]
    Other,
}

/// A single content part of an input or output item.
///
/// Only the `type` discriminator is modelled; everything else stays in
/// `data` so unfamiliar block kinds round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default = "unknown_kind")]
    pub kind: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

fn unknown_kind() -> String {
    "unknown".to_string()
}

impl ContentBlock {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// `input_text` block, used for user/system/tool turns
    pub fn input_text(text: impl Into<String>) -> Self {
        Self::text_block("input_text", text)
    }

    /// `output_text` block, used for assistant turns
    pub fn output_text(text: impl Into<String>) -> Self {
        Self::text_block("output_text", text)
    }

    fn text_block(kind: &str, text: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("text".to_string(), Value::String(text.into()));
        Self::new(kind, data)
    }

    /// Text carried by the block, if it is a text-bearing block
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(Value::as_str)
    }
}

/// One item of a response's `output` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl OutputItem {
    /// Concatenated text of all text-bearing content blocks
    pub fn text(&self) -> String {
        self.content.iter().filter_map(ContentBlock::text).collect()
    }
}

/// Token accounting attached to a finished response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// A response object as returned by `POST /responses` or embedded in
/// `response.*` stream events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default = "response_object")]
    pub object: String,
    /// Unix timestamp in seconds
    #[serde(default, deserialize_with = "unix_seconds")]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

fn response_object() -> String {
    "response".to_string()
}

/// Accepts integer or fractional seconds; fractions are truncated.
fn unix_seconds<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        _ => 0,
    })
}

/// Result of `DELETE /responses/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDeletion {
    pub id: String,
    #[serde(default)]
    pub object: String,
    pub deleted: bool,
}

/// A tool the model may call.
///
/// `parameters` is a JSON-Schema document passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: function_kind(),
            name: name.into(),
            description: None,
            parameters,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A role-tagged message sent as request input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

/// One entry of a request's `input` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputItem {
    Message(InputMessage),
    Raw(Value),
}

impl InputItem {
    pub fn message(role: Role, content: Vec<ContentBlock>) -> Self {
        InputItem::Message(InputMessage { role, content })
    }
}

/// Body of `POST /responses`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCreateRequest {
    pub model: String,
    pub input: Vec<InputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ResponseCreateRequest {
    pub fn new(model: impl Into<String>, input: Vec<InputItem>) -> Self {
        Self {
            model: model.into(),
            input,
            instructions: None,
            metadata: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_output_tokens: None,
            parallel_tool_calls: None,
            tools: None,
            previous_response_id: None,
            stream: None,
        }
    }
}
