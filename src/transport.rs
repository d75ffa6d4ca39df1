//! HTTP transport for the Responses API
//!
//! The transport owns everything that touches the network: building requests
//! with the right headers, turning a `text/event-stream` body into
//! [`RawFrame`]s, and mapping failures onto [`Error`].
//!
//! # Stream lifecycle
//!
//! ```text
//! POST /responses?stream=true
//!     │
//!     │ non-2xx status ──────────────► Error::Api / Error::Http
//!     │ 2xx, not an event stream ────► recovery fetch ──► Error::Api / Error::Http
//!     ▼
//! bytes_stream().eventsource()      (SSE records, split on blank lines)
//!     │
//!     │ error before first frame ───► recovery fetch ──► Error::Api / Error::Http
//!     ▼
//! FrameStream                       (idle timeout, close-once guard)
//! ```
//!
//! The recovery fetch re-issues the same request without streaming so the
//! service's structured error body can be surfaced instead of a generic
//! transport error. It is controlled by
//! [`ClientOptions::recover_stream_errors`](crate::ClientOptions).

use crate::config::ClientOptions;
use crate::retry::retry_with_backoff_conditional;
use crate::types::{Response, ResponseCreateRequest, ResponseDeletion};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderMap};
use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

const RESPONSES_PATH: &str = "responses";
const JSON_MIME: &str = "application/json";
const EVENT_STREAM_MIME: &str = "text/event-stream";
const ORGANIZATION_HEADER: &str = "OpenAI-Organization";
const PROJECT_HEADER: &str = "OpenAI-Project";

/// One server-sent-event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Out-of-band `event:` name, when the server sent one
    pub event: Option<String>,
    pub data: String,
}

impl RawFrame {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

impl From<eventsource_stream::Event> for RawFrame {
    fn from(event: eventsource_stream::Event) -> Self {
        // The SSE parser reports a missing `event:` line as "message".
        let name = match event.event.as_str() {
            "" | "message" => None,
            _ => Some(event.event),
        };
        Self {
            event: name,
            data: event.data,
        }
    }
}

type BoxFrameStream = Pin<Box<dyn Stream<Item = Result<RawFrame>> + Send>>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// A cancellable sequence of frames.
///
/// The underlying connection is released by [`FrameStream::close`], which
/// runs at most once no matter how many paths reach it (explicit close,
/// end of stream, error, idle timeout, drop). After closing, the stream
/// yields `None`.
pub struct FrameStream {
    inner: Option<BoxFrameStream>,
    idle_timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    finished: AtomicBool,
    on_close: Option<CloseHook>,
}

impl FrameStream {
    pub fn new<S>(frames: S, idle_timeout: Option<Duration>) -> Self
    where
        S: Stream<Item = Result<RawFrame>> + Send + 'static,
    {
        Self {
            inner: Some(Box::pin(frames)),
            idle_timeout,
            deadline: None,
            finished: AtomicBool::new(false),
            on_close: None,
        }
    }

    /// Frames from an in-memory list; used by tests and custom transports
    pub fn from_frames(frames: Vec<Result<RawFrame>>) -> Self {
        Self::new(stream::iter(frames), None)
    }

    /// Registers a callback run when the stream is closed
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Drops the underlying connection. Idempotent.
    pub fn close(&mut self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.inner = None;
        self.deadline = None;
        if let Some(hook) = self.on_close.take() {
            hook();
        }
        log::debug!("event stream closed");
    }

    fn arm_deadline(&mut self) {
        if let Some(timeout) = self.idle_timeout {
            let at = Instant::now() + timeout;
            match self.deadline.as_mut() {
                Some(deadline) => deadline.as_mut().reset(at),
                None => self.deadline = Some(Box::pin(tokio::time::sleep_until(at))),
            }
        }
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("idle_timeout", &self.idle_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Stream for FrameStream {
    type Item = Result<RawFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.arm_deadline();
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.deadline.is_none() {
                    this.arm_deadline();
                }
                if let Some(deadline) = this.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        log::warn!("no stream frame within {:?}", this.idle_timeout);
                        this.close();
                        return Poll::Ready(Some(Err(Error::timeout())));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// The network seam of a conversation session.
///
/// [`HttpTransport`] is the production implementation; tests substitute
/// their own to feed scripted frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a streaming response for `request`
    async fn open_stream(&self, request: &ResponseCreateRequest) -> Result<FrameStream>;

    /// Issues `request` without streaming and waits for the full response
    async fn create(&self, request: &ResponseCreateRequest) -> Result<Response>;
}

/// [`Transport`] over HTTP using `reqwest`.
///
/// Two clients are kept: one with the overall request timeout for ordinary
/// calls, and one without it for streams, whose liveness is governed by the
/// idle timeout between frames instead.
#[derive(Clone)]
pub struct HttpTransport {
    options: Arc<ClientOptions>,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("options", &self.options)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(options.timeout)
            .build()?;

        Ok(Self {
            options: Arc::new(options),
            client,
            stream_client,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Resolves `path` against the base URL. Paths that already start with
    /// `http` are used verbatim.
    pub fn url(&self, path: &str) -> Result<Url> {
        let raw = if path.starts_with("http") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.options.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };
        Url::parse(&raw).map_err(|e| Error::invalid_target(format!("{}: {}", raw, e)))
    }

    fn prepare(
        &self,
        client: &reqwest::Client,
        method: Method,
        path: &str,
        accept: &'static str,
    ) -> Result<reqwest::RequestBuilder> {
        let url = self.url(path)?;
        log::debug!("{} {}", method, url);

        let mut builder = client.request(method, url).header(ACCEPT, accept);
        if let Some(key) = &self.options.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", key));
        }
        if let Some(organization) = &self.options.organization {
            builder = builder.header(ORGANIZATION_HEADER, organization);
        }
        if let Some(project) = &self.options.project {
            builder = builder.header(PROJECT_HEADER, project);
        }
        Ok(builder)
    }

    /// Single request/response round trip
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        let mut builder = self.prepare(&self.client, method, path, JSON_MIME)?;
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, JSON_MIME).body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(Error::from_status(status.as_u16(), body));
        }

        serde_json::from_slice(&bytes).map_err(Error::ResponseDecoding)
    }

    /// Round trip with the configured retry policy, if any
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        match &self.options.retry {
            Some(config) => {
                retry_with_backoff_conditional(config.clone(), || {
                    self.execute(method.clone(), path, body.clone())
                })
                .await
            }
            None => self.execute(method, path, body).await,
        }
    }

    /// `GET /responses/{id}`
    pub async fn retrieve(&self, id: &str) -> Result<Response> {
        let path = response_path(id, "")?;
        self.call(Method::GET, &path, None).await
    }

    /// `POST /responses/{id}/cancel`
    pub async fn cancel(&self, id: &str) -> Result<Response> {
        let path = response_path(id, "/cancel")?;
        self.call(Method::POST, &path, None).await
    }

    /// `DELETE /responses/{id}`
    pub async fn delete(&self, id: &str) -> Result<ResponseDeletion> {
        let path = response_path(id, "")?;
        self.call(Method::DELETE, &path, None).await
    }

    /// Re-issues `request` without streaming to recover the structured error
    /// behind a stream that failed before delivering any data.
    async fn recover_stream_error(&self, request: &ResponseCreateRequest, original: Error) -> Error {
        if !self.options.recover_stream_errors {
            return original;
        }

        log::debug!(
            "stream failed before any data ({}); re-issuing request without streaming",
            original
        );
        let mut body = request.clone();
        body.stream = None;
        let Ok(payload) = encode(&body) else {
            return original;
        };

        match self
            .execute::<serde_json::Value>(Method::POST, RESPONSES_PATH, Some(payload))
            .await
        {
            Err(recovered @ (Error::Api { .. } | Error::Http { .. })) => recovered,
            Err(e) => {
                log::warn!("recovery fetch failed: {}", e);
                original
            }
            Ok(_) => {
                log::warn!("recovery fetch succeeded; keeping the stream error");
                original
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, request: &ResponseCreateRequest) -> Result<FrameStream> {
        let mut body = request.clone();
        body.stream = Some(true);
        let payload = encode(&body)?;

        let response = self
            .prepare(&self.stream_client, Method::POST, RESPONSES_PATH, EVENT_STREAM_MIME)?
            .query(&[("stream", "true")])
            .header(CACHE_CONTROL, "no-cache")
            .header(CONTENT_TYPE, JSON_MIME)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|e| {
                log::warn!("failed to read error response body: {}", e);
                String::new()
            });
            return Err(Error::from_status(status.as_u16(), body));
        }

        if !is_event_stream(response.headers()) {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let error =
                Error::stream_decoding(format!("unexpected content type '{}'", content_type));
            return Err(self.recover_stream_error(request, error).await);
        }

        log::debug!("event stream opened ({})", status);

        let frames = response.bytes_stream().eventsource().map(|item| match item {
            Ok(event) => Ok(RawFrame::from(event)),
            Err(e) => Err(map_event_stream_error(e)),
        });

        let recovery = Some((self.clone(), request.clone()));
        let frames = stream::unfold(
            (Box::pin(frames), recovery),
            |(mut frames, recovery)| async move {
                match frames.next().await? {
                    Ok(frame) => Some((Ok(frame), (frames, None))),
                    Err(e) => {
                        let e = match recovery {
                            Some((transport, request)) => {
                                transport.recover_stream_error(&request, e).await
                            }
                            None => e,
                        };
                        Some((Err(e), (frames, None)))
                    }
                }
            },
        );

        Ok(FrameStream::new(
            frames,
            Some(self.options.effective_streaming_timeout()),
        ))
    }

    async fn create(&self, request: &ResponseCreateRequest) -> Result<Response> {
        let mut body = request.clone();
        body.stream = None;
        let payload = encode(&body)?;
        self.call(Method::POST, RESPONSES_PATH, Some(payload)).await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::RequestEncoding)
}

fn response_path(id: &str, suffix: &str) -> Result<String> {
    if id.is_empty() || id.contains('/') {
        return Err(Error::invalid_target(format!("invalid response id '{}'", id)));
    }
    Ok(format!("{}/{}{}", RESPONSES_PATH, id, suffix))
}

/// A missing content type is tolerated; anything other than an event
/// stream is not.
fn is_event_stream(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(value) => value.trim_start().starts_with(EVENT_STREAM_MIME),
        None => true,
    }
}

fn map_event_stream_error(error: EventStreamError<reqwest::Error>) -> Error {
    match error {
        EventStreamError::Transport(e) => Error::Network(e),
        other => Error::stream_decoding(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::AtomicUsize;

    fn transport(base_url: &str) -> HttpTransport {
        let options = ClientOptions::builder().base_url(base_url).build().unwrap();
        HttpTransport::new(options).unwrap()
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let transport = transport("http://localhost:8080/v1/");
        assert_eq!(
            transport.url("responses").unwrap().as_str(),
            "http://localhost:8080/v1/responses"
        );
        assert_eq!(
            transport.url("/responses/resp_1").unwrap().as_str(),
            "http://localhost:8080/v1/responses/resp_1"
        );
    }

    #[test]
    fn test_absolute_path_used_verbatim() {
        let transport = transport("http://localhost:8080/v1");
        assert_eq!(
            transport.url("https://example.com/other").unwrap().as_str(),
            "https://example.com/other"
        );
    }

    #[test]
    fn test_response_path_rejects_bad_ids() {
        assert_eq!(response_path("resp_1", "/cancel").unwrap(), "responses/resp_1/cancel");
        assert!(matches!(
            response_path("", ""),
            Err(Error::InvalidRequestTarget(_))
        ));
        assert!(matches!(
            response_path("a/b", ""),
            Err(Error::InvalidRequestTarget(_))
        ));
    }

    #[test]
    fn test_event_stream_content_type() {
        let mut headers = HeaderMap::new();
        assert!(is_event_stream(&headers));

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        assert!(is_event_stream(&headers));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn test_frame_from_sse_event() {
        let unnamed = RawFrame::from(eventsource_stream::Event {
            event: "message".to_string(),
            data: "{}".to_string(),
            id: String::new(),
            retry: None,
        });
        assert_eq!(unnamed.event, None);

        let named = RawFrame::from(eventsource_stream::Event {
            event: "response.created".to_string(),
            data: "{}".to_string(),
            id: "1".to_string(),
            retry: None,
        });
        assert_eq!(named.event.as_deref(), Some("response.created"));
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let mut frames = FrameStream::from_frames(vec![Ok(RawFrame::new("a"))])
            .on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        frames.close();
        frames.close();
        assert!(frames.is_closed());
        assert!(frames.next().await.is_none());
        drop(frames);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_natural_end_closes() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let mut frames = FrameStream::from_frames(vec![Ok(RawFrame::new("a"))])
            .on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(frames.next().await.is_some());
        assert!(frames.next().await.is_none());
        frames.close();
        drop(frames);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_terminates_stream() {
        let mut frames = FrameStream::from_frames(vec![
            Err(Error::stream_decoding("reset")),
            Ok(RawFrame::new("never seen")),
        ]);

        assert!(matches!(frames.next().await, Some(Err(Error::StreamDecoding(_)))));
        assert!(frames.next().await.is_none());
    }

    #[test]
    fn test_no_idle_timeout_stays_pending_until_closed() {
        let mut frames = tokio_test::task::spawn(FrameStream::new(
            stream::pending::<Result<RawFrame>>(),
            None,
        ));

        tokio_test::assert_pending!(frames.poll_next());
        frames.close();
        assert!(tokio_test::assert_ready!(frames.poll_next()).is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let mut frames = FrameStream::new(
            stream::pending::<Result<RawFrame>>(),
            Some(Duration::from_millis(20)),
        );

        assert!(matches!(frames.next().await, Some(Err(Error::Timeout))));
        assert!(frames.is_closed());
        assert!(frames.next().await.is_none());
    }
}
