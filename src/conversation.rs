//! Conversation state published to consumers
//!
//! A [`ConversationStateSnapshot`] is an immutable value: the reducer never
//! edits one in place, it clones and returns the next snapshot. Each phase
//! enum is an independent state machine; terminal variants are noted on the
//! individual types.

use crate::types::Role;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in whole seconds
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn next_message_id() -> String {
    format!("msg_{:016x}", rand::random::<u64>())
}

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    /// Maps a wire role onto a transcript role.
    ///
    /// `developer` folds into `system`; unknown roles have no transcript
    /// counterpart.
    pub fn from_wire(role: Role) -> Option<Self> {
        match role {
            Role::User => Some(MessageRole::User),
            Role::Assistant => Some(MessageRole::Assistant),
            Role::System | Role::Developer => Some(MessageRole::System),
            Role::Tool => Some(MessageRole::Tool),
            Role::Other => None,
        }
    }

    pub fn to_wire(self) -> Role {
        match self {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
            MessageRole::System => Role::System,
            MessageRole::Tool => Role::Tool,
        }
    }
}

/// One entry of the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    /// Unix timestamp in seconds
    pub created_at: i64,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            role,
            text: text.into(),
            created_at: unix_now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }
}

/// Progress of the response as a whole.
///
/// `Completed`, `Failed` and `Paused` are terminal for a given stream; only a
/// fresh start moves the session back to `Preparing`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ResponsePhase {
    #[default]
    Idle,
    Preparing,
    AwaitingResponse,
    Streaming,
    Paused,
    Completed,
    Failed(String),
}

impl ResponsePhase {
    /// True while a response is expected or arriving
    pub fn is_streaming(&self) -> bool {
        matches!(self, ResponsePhase::AwaitingResponse | ResponsePhase::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponsePhase::Completed | ResponsePhase::Failed(_) | ResponsePhase::Paused
        )
    }
}

/// Progress of a hosted web search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WebSearchPhase {
    #[default]
    None,
    Initiated {
        query: Option<String>,
    },
    Searching,
    /// Reserved; no current event type routes here.
    Analyzing,
    Completed,
    Failed {
        reason: Option<String>,
    },
}

/// Progress of a hosted file search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileSearchPhase {
    #[default]
    None,
    Preparing,
    Searching,
    Completed,
    Failed {
        reason: Option<String>,
    },
}

/// Progress of model reasoning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReasoningPhase {
    #[default]
    None,
    Drafting,
    Reasoning,
    Completed {
        summary: Option<String>,
    },
    Failed {
        reason: Option<String>,
    },
}

/// Progress of a tool or code-interpreter invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolCallPhase {
    #[default]
    None,
    Running {
        name: Option<String>,
        kind: Option<String>,
    },
    AwaitingOutput {
        name: Option<String>,
        kind: Option<String>,
    },
    Completed {
        name: Option<String>,
        kind: Option<String>,
    },
    Failed {
        name: Option<String>,
        kind: Option<String>,
        reason: Option<String>,
    },
}

/// Fully merged view of a conversation at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStateSnapshot {
    pub messages: Vec<ConversationMessage>,
    pub response_phase: ResponsePhase,
    pub web_search_phase: WebSearchPhase,
    pub file_search_phase: FileSearchPhase,
    pub reasoning_phase: ReasoningPhase,
    pub tool_call_phase: ToolCallPhase,
    pub last_response_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Latest creation time seen, in Unix seconds; never moves backwards
    pub created_at: Option<i64>,
    pub metadata: Option<Map<String, Value>>,
}

impl ConversationStateSnapshot {
    pub fn new(messages: Vec<ConversationMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Text of the trailing assistant message, if the transcript ends with one
    pub fn latest_assistant_text(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == MessageRole::Assistant)
            .map(|m| m.text.as_str())
    }
}
