//! Client configuration and environment helpers

use crate::retry::RetryConfig;
use crate::{Error, Result};
use std::env;
use std::time::Duration;

/// Default endpoint of the hosted Responses API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const BASE_URL_ENV: &str = "RESPONSES_BASE_URL";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Options supplied by the embedding application.
///
/// Built through [`ClientOptions::builder`]. The only validation happens at
/// build time: the base URL must be an absolute `http`/`https` URL.
#[derive(Clone)]
pub struct ClientOptions {
    /// Bearer token sent in the `Authorization` header
    pub api_key: Option<String>,

    /// Sent as `OpenAI-Organization` when present
    pub organization: Option<String>,

    /// Sent as `OpenAI-Project` when present
    pub project: Option<String>,

    /// Endpoint root, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Timeout for ordinary request/response calls
    pub timeout: Duration,

    /// Idle timeout between frames of a stream (falls back to `timeout`)
    pub streaming_timeout: Option<Duration>,

    /// Re-issue a failed stream request without streaming to recover the
    /// authoritative status and error body
    pub recover_stream_errors: bool,

    /// Backoff policy for non-streaming calls (disabled when `None`)
    pub retry: Option<RetryConfig>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("organization", &self.organization)
            .field("project", &self.project)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("streaming_timeout", &self.streaming_timeout)
            .field("recover_stream_errors", &self.recover_stream_errors)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            organization: None,
            project: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
            streaming_timeout: None,
            recover_stream_errors: true,
            retry: None,
        }
    }
}

impl ClientOptions {
    /// Create a new builder for ClientOptions
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Timeout applied between frames of a streaming response.
    pub fn effective_streaming_timeout(&self) -> Duration {
        self.streaming_timeout.unwrap_or(self.timeout)
    }
}

/// Builder for ClientOptions
#[derive(Default)]
pub struct ClientOptionsBuilder {
    api_key: Option<String>,
    organization: Option<String>,
    project: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    streaming_timeout: Option<Duration>,
    recover_stream_errors: Option<bool>,
    retry: Option<RetryConfig>,
}

impl std::fmt::Debug for ClientOptionsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptionsBuilder")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("streaming_timeout", &self.streaming_timeout)
            .finish()
    }
}

impl ClientOptionsBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn streaming_timeout(mut self, timeout: Duration) -> Self {
        self.streaming_timeout = Some(timeout);
        self
    }

    pub fn recover_stream_errors(mut self, enabled: bool) -> Self {
        self.recover_stream_errors = Some(enabled);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn build(self) -> Result<ClientOptions> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|e| Error::invalid_target(format!("{}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::invalid_target(format!(
                "{}: unsupported scheme '{}'",
                base_url,
                parsed.scheme()
            )));
        }

        let timeout = self.timeout.unwrap_or(Duration::from_secs(120));
        if timeout.is_zero() {
            return Err(Error::config("timeout must be greater than zero"));
        }

        Ok(ClientOptions {
            api_key: self.api_key,
            organization: self.organization,
            project: self.project,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            streaming_timeout: self.streaming_timeout,
            recover_stream_errors: self.recover_stream_errors.unwrap_or(true),
            retry: self.retry,
        })
    }
}

/// Get the base URL from environment variable or fallback
///
/// Priority:
/// 1. RESPONSES_BASE_URL environment variable
/// 2. fallback parameter
/// 3. [`DEFAULT_BASE_URL`]
///
/// # Examples
///
/// ```rust,no_run
/// use responses_stream::get_base_url;
///
/// let url = get_base_url(Some("http://localhost:8080/v1"));
/// ```
pub fn get_base_url(fallback: Option<&str>) -> String {
    if let Ok(url) = env::var(BASE_URL_ENV) {
        return url;
    }

    fallback.unwrap_or(DEFAULT_BASE_URL).to_string()
}

/// Get the API key from the OPENAI_API_KEY environment variable
pub fn get_api_key() -> Option<String> {
    env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty())
}
