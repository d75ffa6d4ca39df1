//! Conversation sessions
//!
//! A [`ConversationSession`] owns one logical conversation. All of its state
//! lives in a single actor task; the handle only sends commands over a
//! channel, so the handle is cheap to clone and never holds a lock.
//!
//! ```text
//! ConversationSession ──commands──► SessionActor
//!                                       │ spawns one driver per stream
//!                                       ▼
//!                       Transport ─► parse_frame ─► reduce
//!                                       │
//!          SnapshotStream ◄──bounded────┤
//!          snapshot()     ◄──watch──────┘
//! ```
//!
//! At most one stream is active per session. Starting a new stream cancels
//! the previous one and waits until its connection is closed. Cancellation
//! leaves the snapshot `Paused`; it is never reported as a failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use responses_stream::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let options = ClientOptions::builder()
//!     .api_key(get_api_key().unwrap_or_default())
//!     .build()?;
//! let session = ConversationSession::connect(options, ConversationRequestBuilder::new("gpt-4.1"))?;
//!
//! let mut stream = session.start(vec![ConversationMessage::user("Hi")]).await?;
//! while let Some(snapshot) = stream.next().await {
//!     if let Some(text) = snapshot.latest_assistant_text() {
//!         println!("{}", text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ClientOptions;
use crate::conversation::{ConversationMessage, ConversationStateSnapshot, ResponsePhase};
use crate::event::parse_frame;
use crate::reducer::{apply_metadata, merge_response, reduce};
use crate::request::ConversationRequestBuilder;
use crate::transport::{FrameStream, HttpTransport, Transport};
use crate::types::ResponseCreateRequest;
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;

/// Snapshots buffered ahead of a slow consumer
const SNAPSHOT_BUFFER: usize = 1;
const COMMAND_BUFFER: usize = 16;

const EMPTY_STREAM: &str = "stream ended before a response was received";

/// Why a snapshot stream stopped
#[derive(Debug)]
pub enum StreamEnd {
    /// The server closed the stream
    Completed,
    /// The stream was cancelled or superseded, or its consumer went away
    Cancelled,
    /// The transport failed; the last snapshot is `Failed` as well
    Failed(Error),
}

/// Ordered snapshots of one streamed response.
///
/// The channel behind it is bounded, so a consumer that stops reading
/// suspends the producer instead of letting snapshots pile up. The final
/// snapshot is always terminal: `Completed`, `Failed` or `Paused`.
pub struct SnapshotStream {
    snapshots: ReceiverStream<ConversationStateSnapshot>,
    end: oneshot::Receiver<StreamEnd>,
}

impl SnapshotStream {
    /// Reports why the stream stopped.
    ///
    /// Any unread snapshots are discarded; if the stream is still running
    /// this cancels it.
    pub async fn end_reason(self) -> StreamEnd {
        let SnapshotStream { snapshots, end } = self;
        drop(snapshots);
        end.await.unwrap_or(StreamEnd::Cancelled)
    }

    /// Drains the stream, returning the final snapshot and the end reason
    pub async fn finish(mut self) -> (Option<ConversationStateSnapshot>, StreamEnd) {
        let mut last = None;
        while let Some(snapshot) = self.next().await {
            last = Some(snapshot);
        }
        (last, self.end_reason().await)
    }
}

impl Stream for SnapshotStream {
    type Item = ConversationStateSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.snapshots.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for SnapshotStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStream").finish_non_exhaustive()
    }
}

enum Command {
    Start {
        messages: Vec<ConversationMessage>,
        reply: oneshot::Sender<SnapshotStream>,
    },
    SendOnce {
        messages: Vec<ConversationMessage>,
        reply: oneshot::Sender<Result<ConversationStateSnapshot>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a conversation.
///
/// Dropping the last handle stops the actor and cancels any active stream.
#[derive(Clone)]
pub struct ConversationSession {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConversationStateSnapshot>,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("response_phase", &self.state.borrow().response_phase)
            .finish()
    }
}

impl ConversationSession {
    /// Spawns the session actor. Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, builder: ConversationRequestBuilder) -> Self {
        let (state_tx, state_rx) = watch::channel(ConversationStateSnapshot::default());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let actor = SessionActor {
            transport,
            builder,
            state: Arc::new(state_tx),
            active: None,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            state: state_rx,
        }
    }

    /// Session over [`HttpTransport`]
    pub fn connect(options: ClientOptions, builder: ConversationRequestBuilder) -> Result<Self> {
        let transport = HttpTransport::new(options)?;
        Ok(Self::new(Arc::new(transport), builder))
    }

    /// Streams a response to `messages`.
    ///
    /// The first snapshot is `AwaitingResponse` and is published before any
    /// network traffic.
    pub async fn start(&self, messages: Vec<ConversationMessage>) -> Result<SnapshotStream> {
        self.request(|reply| Command::Start { messages, reply }).await
    }

    /// Requests a response without streaming and returns the merged snapshot
    pub async fn send_once(
        &self,
        messages: Vec<ConversationMessage>,
    ) -> Result<ConversationStateSnapshot> {
        self.request(|reply| Command::SendOnce { messages, reply })
            .await?
    }

    /// Cancels the active stream, if any. Returns once its connection is closed.
    pub async fn cancel(&self) -> Result<()> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Cancels the active stream and forgets the conversation
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> ConversationStateSnapshot {
        self.state.borrow().clone()
    }

    /// Watches snapshot changes without consuming a stream
    pub fn subscribe(&self) -> watch::Receiver<ConversationStateSnapshot> {
        self.state.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }
}

struct ActiveStream {
    cancel: watch::Sender<bool>,
    closed: oneshot::Receiver<()>,
}

struct SessionActor {
    transport: Arc<dyn Transport>,
    builder: ConversationRequestBuilder,
    state: Arc<watch::Sender<ConversationStateSnapshot>>,
    active: Option<ActiveStream>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start { messages, reply } => {
                    let stream = self.start(messages).await;
                    let _ = reply.send(stream);
                }
                Command::SendOnce { messages, reply } => {
                    let result = self.send_once(messages).await;
                    let _ = reply.send(result);
                }
                Command::Cancel { reply } => {
                    log::debug!("cancelling active stream");
                    self.stop_active().await;
                    let _ = reply.send(());
                }
                Command::Reset { reply } => {
                    self.stop_active().await;
                    self.state.send_replace(ConversationStateSnapshot::default());
                    let _ = reply.send(());
                }
            }
        }

        self.stop_active().await;
        log::debug!("conversation session closed");
    }

    /// Cancels the running stream and waits until its connection is closed
    async fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(true);
            let _ = active.closed.await;
        }
    }

    /// Snapshot for a new exchange, carrying the conversation identity forward
    fn prepare(&self, messages: Vec<ConversationMessage>) -> ConversationStateSnapshot {
        let previous = self.state.borrow().clone();
        let snapshot = ConversationStateSnapshot {
            messages,
            response_phase: ResponsePhase::Preparing,
            last_response_id: previous.last_response_id,
            conversation_id: previous.conversation_id,
            created_at: previous.created_at,
            metadata: previous.metadata,
            ..Default::default()
        };
        self.state.send_replace(snapshot.clone());
        snapshot
    }

    async fn start(&mut self, messages: Vec<ConversationMessage>) -> SnapshotStream {
        self.stop_active().await;

        let snapshot = self.prepare(messages);
        let request = self
            .builder
            .make_request(&snapshot.messages, snapshot.last_response_id.as_deref());
        log::debug!(
            "starting stream with {} message(s), previous response {:?}",
            request.input.len(),
            request.previous_response_id
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = oneshot::channel();
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let (end_tx, end_rx) = oneshot::channel();

        let driver = StreamDriver {
            transport: self.transport.clone(),
            state: self.state.clone(),
            snapshots: snapshot_tx,
            cancel: cancel_rx,
            closed: Some(closed_tx),
            delivered: false,
        };
        tokio::spawn(async move {
            let end = driver.run(request, snapshot).await;
            log::debug!("stream finished: {:?}", end);
            let _ = end_tx.send(end);
        });

        self.active = Some(ActiveStream {
            cancel: cancel_tx,
            closed: closed_rx,
        });

        SnapshotStream {
            snapshots: ReceiverStream::new(snapshot_rx),
            end: end_rx,
        }
    }

    async fn send_once(
        &mut self,
        messages: Vec<ConversationMessage>,
    ) -> Result<ConversationStateSnapshot> {
        self.stop_active().await;

        let mut snapshot = self.prepare(messages);
        let request = self
            .builder
            .make_request(&snapshot.messages, snapshot.last_response_id.as_deref());

        match self.transport.create(&request).await {
            Ok(response) => {
                snapshot.messages = merge_response(&snapshot.messages, &response);
                apply_metadata(&mut snapshot, &response);
                snapshot.response_phase = match &response.error {
                    Some(error) => ResponsePhase::Failed(
                        error
                            .message
                            .clone()
                            .unwrap_or_else(|| "Unknown error".to_string()),
                    ),
                    None => ResponsePhase::Completed,
                };
                self.state.send_replace(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                snapshot.response_phase = ResponsePhase::Failed(e.to_string());
                self.state.send_replace(snapshot);
                Err(e)
            }
        }
    }
}

/// Drives one stream: the single writer of its snapshot
struct StreamDriver {
    transport: Arc<dyn Transport>,
    state: Arc<watch::Sender<ConversationStateSnapshot>>,
    snapshots: mpsc::Sender<ConversationStateSnapshot>,
    cancel: watch::Receiver<bool>,
    closed: Option<oneshot::Sender<()>>,
    /// Whether the consumer has received the latest snapshot
    delivered: bool,
}

/// `Completed` and `Failed` are only left by a new exchange.
fn is_settled(phase: &ResponsePhase) -> bool {
    matches!(phase, ResponsePhase::Completed | ResponsePhase::Failed(_))
}

/// Resolves once cancellation is requested or the session side is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

impl StreamDriver {
    async fn run(
        mut self,
        request: ResponseCreateRequest,
        mut snapshot: ConversationStateSnapshot,
    ) -> StreamEnd {
        snapshot.response_phase = ResponsePhase::AwaitingResponse;
        if !self.publish(&snapshot).await {
            return self.finish(snapshot, None, StreamEnd::Cancelled).await;
        }

        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => None,
            _ = self.snapshots.closed() => None,
            opened = self.transport.open_stream(&request) => Some(opened),
        };
        let mut frames = match opened {
            None => return self.finish(snapshot, None, StreamEnd::Cancelled).await,
            Some(Err(e)) => return self.finish(snapshot, None, StreamEnd::Failed(e)).await,
            Some(Ok(frames)) => frames,
        };

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => break StreamEnd::Cancelled,
                _ = self.snapshots.closed() => break StreamEnd::Cancelled,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    let Some(event) = parse_frame(&frame) else {
                        continue;
                    };
                    snapshot = reduce(&snapshot, &event);
                    if !self.publish(&snapshot).await {
                        break StreamEnd::Cancelled;
                    }
                    // Nothing after a terminal event can change the outcome
                    if is_settled(&snapshot.response_phase) {
                        break StreamEnd::Completed;
                    }
                }
                Some(Err(e)) => break StreamEnd::Failed(e),
                None => break StreamEnd::Completed,
            }
        };

        self.finish(snapshot, Some(frames), end).await
    }

    /// Sends `snapshot` to the watch and the consumer. Returns `false` when
    /// cancelled or when the consumer has gone away.
    async fn publish(&mut self, snapshot: &ConversationStateSnapshot) -> bool {
        self.delivered = false;
        self.state.send_replace(snapshot.clone());

        let sent = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return false,
            sent = self.snapshots.send(snapshot.clone()) => sent.is_ok(),
        };
        self.delivered = sent;
        sent
    }

    /// Closes the connection, settles the final phase and publishes it.
    async fn finish(
        mut self,
        mut snapshot: ConversationStateSnapshot,
        frames: Option<FrameStream>,
        end: StreamEnd,
    ) -> StreamEnd {
        if let Some(mut frames) = frames {
            frames.close();
        }

        let before = snapshot.response_phase.clone();
        let end = match end {
            StreamEnd::Cancelled => {
                if !is_settled(&snapshot.response_phase) {
                    snapshot.response_phase = ResponsePhase::Paused;
                }
                StreamEnd::Cancelled
            }
            StreamEnd::Failed(e) if is_settled(&snapshot.response_phase) => {
                log::debug!("ignoring transport error after the response settled: {}", e);
                StreamEnd::Completed
            }
            StreamEnd::Failed(e) => {
                log::debug!("stream failed: {}", e);
                snapshot.response_phase = ResponsePhase::Failed(e.to_string());
                StreamEnd::Failed(e)
            }
            StreamEnd::Completed => match snapshot.response_phase {
                ResponsePhase::Streaming => {
                    snapshot.response_phase = ResponsePhase::Completed;
                    StreamEnd::Completed
                }
                ResponsePhase::Preparing | ResponsePhase::AwaitingResponse => {
                    snapshot.response_phase = ResponsePhase::Failed(EMPTY_STREAM.to_string());
                    StreamEnd::Failed(Error::stream_decoding(EMPTY_STREAM))
                }
                _ => StreamEnd::Completed,
            },
        };

        self.state.send_replace(snapshot.clone());
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }

        if snapshot.response_phase != before || !self.delivered {
            let _ = self.snapshots.send(snapshot).await;
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_stream_end_reason_after_drain() {
        let (tx, rx) = mpsc::channel(1);
        let (end_tx, end_rx) = oneshot::channel();
        let stream = SnapshotStream {
            snapshots: ReceiverStream::new(rx),
            end: end_rx,
        };

        tokio::spawn(async move {
            let _ = tx.send(ConversationStateSnapshot::default()).await;
            drop(tx);
            let _ = end_tx.send(StreamEnd::Completed);
        });

        let (last, end) = stream.finish().await;
        assert!(last.is_some());
        assert!(matches!(end, StreamEnd::Completed));
    }

    #[tokio::test]
    async fn test_end_reason_defaults_to_cancelled() {
        let (_tx, rx) = mpsc::channel::<ConversationStateSnapshot>(1);
        let (end_tx, end_rx) = oneshot::channel::<StreamEnd>();
        drop(end_tx);
        let stream = SnapshotStream {
            snapshots: ReceiverStream::new(rx),
            end: end_rx,
        };
        assert!(matches!(stream.end_reason().await, StreamEnd::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        cancelled(&mut rx).await;
    }
}
