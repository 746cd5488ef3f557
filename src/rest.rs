use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub const API_BASE_URL_ENV: &str = "API_BASE_URL";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const RETRIES: usize = 3;
}

/// Source of the bearer token attached to outgoing requests.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<SecretString>;
}

/// Provider for unauthenticated clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn token(&self) -> Option<SecretString> {
        None
    }
}

/// Provider that always returns the same token.
#[derive(Clone)]
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::new(token.into()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<SecretString> + Send + Sync,
{
    fn token(&self) -> Option<SecretString> {
        self()
    }
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::rest().with_retries(RestDefaults::RETRIES),
        }
    }
}

/// Per-call overrides for [`RetryingRequestClient::request`].
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Extra headers. An explicit `Authorization` header suppresses token
    /// injection.
    pub headers: HeaderMap,
    /// Retries after the first attempt; falls back to the client policy.
    pub retries: Option<usize>,
    /// Per-attempt timeout; falls back to the client default.
    pub timeout: Option<Duration>,
}

/// Successful response with its body already read.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_str(&self.body).map_err(|err| RequestError::Parse(err.to_string()))
    }
}

/// HTTP client with bounded exponential-backoff retry.
#[derive(Clone)]
pub struct RetryingRequestClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl RetryingRequestClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, RequestError> {
        Self::with_options(base_url, tokens, RestClientOptions::default())
    }

    /// Builds a client against `API_BASE_URL`, or the local default.
    pub fn from_env(tokens: Arc<dyn TokenProvider>) -> Result<Self, RequestError> {
        let base_url = std::env::var(API_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        Self::new(base_url, tokens)
    }

    pub fn with_options(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        options: RestClientOptions,
    ) -> Result<Self, RequestError> {
        let base_url: String = base_url.into();
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RequestError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end().trim_end_matches('/').to_string(),
            tokens,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues a request, retrying network failures, 5xx and 429.
    ///
    /// Other 4xx statuses fail on the first attempt. When retries run out the
    /// last error is returned inside [`RequestError::RetriesExhausted`].
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, RequestError> {
        let endpoint = self.endpoint(url);
        let policy = match options.retries {
            Some(retries) => self.retry_policy.clone().with_retries(retries),
            None => self.retry_policy.clone(),
        };
        let max_attempts = policy.max_attempts.max(1);
        let options = &options;
        let endpoint_ref = endpoint.as_str();

        let result = retry_async(
            &policy,
            |attempt| {
                let method = method.clone();
                async move {
                    let result = self
                        .send_attempt(method.clone(), endpoint_ref, body, options)
                        .await;
                    if let Err(error) = &result {
                        if error.is_retryable() {
                            warn!(
                                event = "request_attempt_failed",
                                method = %method,
                                url = endpoint_ref,
                                attempt,
                                max_attempts,
                                error = %error
                            );
                        }
                    }
                    result
                }
            },
            RequestError::is_retryable,
        )
        .await;

        result.map_err(|failed| {
            if failed.exhausted {
                RequestError::RetriesExhausted {
                    attempts: failed.attempts,
                    source: Box::new(failed.error),
                }
            } else {
                failed.error
            }
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RequestError> {
        self.request(Method::GET, url, None, RequestOptions::default())
            .await?
            .json()
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(RequestError::Encode)?;
        self.request(Method::POST, url, Some(&body), RequestOptions::default())
            .await?
            .json()
    }

    fn endpoint(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    async fn send_attempt(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<ApiResponse, RequestError> {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(options.timeout.unwrap_or(self.attempt_timeout))
            .headers(options.headers.clone());

        if !options.headers.contains_key(AUTHORIZATION) {
            if let Some(token) = self.tokens.token() {
                builder = builder.bearer_auth(token.expose_secret());
            }
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(RequestError::Transport)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(RequestError::Transport)?;

        if !status.is_success() {
            return Err(RequestError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<RequestError>,
    },
}

impl RequestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::Encode(_) | Self::Parse(_) | Self::RetriesExhausted { .. } => false,
        }
    }

    /// HTTP status of the failure, looking through retry exhaustion.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::RetriesExhausted { source, .. } => source.status(),
            Self::Encode(_) | Self::Parse(_) => None,
        }
    }

    /// Number of attempts made before the error was returned.
    pub fn attempts(&self) -> usize {
        match self {
            Self::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
