//! # Responses Stream
//!
//! A streaming client for the OpenAI Responses API that turns server-sent
//! events into a live, consistent view of a conversation.
//!
//! ## Overview
//!
//! Each streamed response is folded, event by event, into an immutable
//! [`ConversationStateSnapshot`]: the message transcript plus independent
//! phases for the response itself, web search, file search, reasoning and
//! tool calls. Consumers render snapshots; they never touch raw events.
//!
//! ## Key Features
//!
//! - **Cancellable Streams**: Cancelling pauses the conversation and closes the connection exactly once
//! - **Lenient Parsing**: A malformed frame becomes an in-band `error` event instead of ending the stream
//! - **Pure Reducer**: `(snapshot, event) -> snapshot`, testable without a network
//! - **Structured Errors**: Service error bodies are surfaced as [`Error::Api`] whenever they can be recovered
//! - **Backpressure**: Snapshots flow through a bounded channel, so slow consumers pause the producer
//! - **Retry Logic**: Exponential backoff with jitter for non-streaming calls
//!
//! ## Streaming a Response
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use responses_stream::{
//!     ClientOptions, ConversationMessage, ConversationRequestBuilder, ConversationSession,
//!     ResponsePhase,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClientOptions::builder()
//!         .api_key("sk-...")
//!         .build()?;
//!
//!     let builder = ConversationRequestBuilder::new("gpt-4.1")
//!         .instructions("You are a helpful assistant");
//!     let session = ConversationSession::connect(options, builder)?;
//!
//!     let mut stream = session
//!         .start(vec![ConversationMessage::user("What's the capital of France?")])
//!         .await?;
//!
//!     while let Some(snapshot) = stream.next().await {
//!         match &snapshot.response_phase {
//!             ResponsePhase::AwaitingResponse => println!("waiting..."),
//!             ResponsePhase::Streaming => {
//!                 if let Some(text) = snapshot.latest_assistant_text() {
//!                     println!("{}", text);
//!                 }
//!             }
//!             ResponsePhase::Failed(reason) => eprintln!("failed: {}", reason),
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Data flows strictly downward:
//!
//! ```text
//! ConversationSession ─► Transport ─► parse_frame ─► reduce ─► SnapshotStream
//! ```
//!
//! - **session**: Single-owner actor; at most one active stream per conversation
//! - **transport**: HTTP/SSE transport, idle timeouts and error recovery
//! - **event**: Frame parsing and lazy event accessors
//! - **reducer**: The pure state machine
//! - **request**: Request construction from the transcript
//! - **conversation**: Snapshot, message and phase types
//! - **types**: Wire types for the Responses API
//! - **config**: Client options and environment helpers
//! - **error**: Error taxonomy
//! - **retry**: Exponential backoff for non-streaming calls

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Client options and environment variable helpers.
mod config;

/// Transcript, snapshot and phase types published to consumers.
mod conversation;

/// Error types and the crate-wide `Result<T>` alias.
mod error;

/// Parsing of stream frames into typed events.
mod event;

/// The pure reducer folding events into snapshots.
mod reducer;

/// Outbound request construction from conversation history.
mod request;

/// Conversation sessions: the actor that drives streams.
mod session;

/// HTTP transport and the `Transport` seam.
mod transport;

/// Wire-level request and response types.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

// --- Session ---

pub use session::{ConversationSession, SnapshotStream, StreamEnd};

// --- Transport ---

pub use transport::{FrameStream, HttpTransport, RawFrame, Transport};

// --- Events and Reduction ---

pub use event::{CHUNK_DECODING_FAILED, RawStreamEvent, parse_events, parse_frame};
pub use reducer::{STAGE_RULES, Stage, classify, merge_response, reduce};

// --- Conversation State ---

pub use conversation::{
    ConversationMessage, ConversationStateSnapshot, FileSearchPhase, MessageRole, ReasoningPhase,
    ResponsePhase, ToolCallPhase, WebSearchPhase,
};

// --- Requests ---

pub use request::{ConversationRequestBuilder, HistoryStrategy};

// --- Configuration ---

pub use config::{ClientOptions, ClientOptionsBuilder, DEFAULT_BASE_URL, get_api_key, get_base_url};

// --- Error Handling ---

pub use error::{ApiErrorBody, Error, Result};

// --- Wire Types ---

pub use types::{
    ContentBlock, InputItem, InputMessage, OutputItem, Response, ResponseCreateRequest,
    ResponseDeletion, ResponseError, ResponseStatus, Role, ToolDefinition, Usage,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most applications need.
///
/// Import with `use responses_stream::prelude::*;`.
pub mod prelude {
    pub use crate::{
        ClientOptions, ConversationMessage, ConversationRequestBuilder, ConversationSession,
        ConversationStateSnapshot, Error, HistoryStrategy, ResponsePhase, Result, SnapshotStream,
        StreamEnd, ToolDefinition, get_api_key, get_base_url,
    };
}
