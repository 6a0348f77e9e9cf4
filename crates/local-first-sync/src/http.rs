//! Retrying HTTP transport.
//!
//! Every remote leg of the synchronization layer goes through
//! [`HttpTransport::request`]: it builds the request from an [`Endpoint`],
//! classifies the HTTP status, and retries connectivity-class failures a
//! bounded number of times with a fixed delay. Non-2xx statuses are never
//! retried; a 401 additionally fires the authentication-failed hook so the
//! embedder can drop its session.
//!
//! Typed decoding helpers sit on top of `request`: JSON (date fields are
//! expected as RFC 3339 strings, see [`crate::record::Record`]), raw text, and
//! a boolean confirmation that discards the body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{NetworkError, SyncError};
use crate::telemetry::{NoopTelemetry, SyncTelemetry};

/// Default number of attempts for connectivity-class failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Description of a single remote call.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub query: Vec<(String, String)>,
}

impl Endpoint {
    pub fn new(method: Method, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
            method,
            headers: HeaderMap::new(),
            body: None,
            query: Vec::new(),
        }
    }

    pub fn get(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, base_url, path)
    }

    pub fn post(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::POST, base_url, path)
    }

    pub fn put(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PUT, base_url, path)
    }

    pub fn patch(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, base_url, path)
    }

    /// Appends a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets a header; invalid names or values are rejected.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, NetworkError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| NetworkError::InvalidUrl(format!("invalid header name {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| NetworkError::InvalidUrl(format!("invalid value for header {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Serialises `body` as the JSON request body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, SyncError> {
        let encoded = serde_json::to_vec(body)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(encoded));
        Ok(self)
    }

    /// Attaches the identity token as a bearer credential.
    pub fn with_bearer(mut self, token: &str) -> Result<Self, NetworkError> {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| NetworkError::InvalidUrl("token is not a valid header value".into()))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    /// Resolves the full URL, including query parameters.
    pub fn url(&self) -> Result<Url, NetworkError> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined).map_err(|_| NetworkError::InvalidUrl(joined.clone()))?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn prepare(&self) -> Result<PreparedRequest, NetworkError> {
        Ok(PreparedRequest {
            method: self.method.clone(),
            url: self.url()?,
            headers: self.headers.clone(),
            body: self.body.clone(),
        })
    }
}

/// Request ready to be handed to an [`HttpExecutor`].
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Classified transport-level failure.
#[derive(Debug, Clone)]
pub enum TransportFailure {
    /// Connection refused, DNS failure, timeout: worth retrying.
    Connectivity(String),
    /// The exchange completed but the body could not be read.
    InvalidResponse(String),
    /// Anything else; never retried.
    Other(String),
}

/// Executes one HTTP exchange. Implemented over `reqwest` in production.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse, TransportFailure>;
}

/// [`HttpExecutor`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| NetworkError::Connection(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: PreparedRequest) -> Result<RawResponse, TransportFailure> {
        let builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        let builder = match request.body {
            Some(body) => builder.body(body),
            None => builder,
        };
        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportFailure::InvalidResponse(err.to_string()))?;
        Ok(RawResponse { status, body })
    }
}

/// Maps a `reqwest` send failure onto the retry taxonomy.
fn classify_reqwest_error(err: reqwest::Error) -> TransportFailure {
    if err.is_connect() || err.is_timeout() {
        TransportFailure::Connectivity(err.to_string())
    } else {
        TransportFailure::Other(err.to_string())
    }
}

/// Fixed-delay retry policy for connectivity-class failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between two attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// One-way notification fired when the backend answers 401.
pub type UnauthorizedHook = Arc<dyn Fn() + Send + Sync>;

/// Transport that retries connectivity failures and classifies statuses.
#[derive(Clone)]
pub struct HttpTransport {
    executor: Arc<dyn HttpExecutor>,
    policy: RetryPolicy,
    unauthorized_hook: Option<UnauthorizedHook>,
    telemetry: Arc<dyn SyncTelemetry>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("policy", &self.policy)
            .field("unauthorized_hook", &self.unauthorized_hook.is_some())
            .finish()
    }
}

impl HttpTransport {
    /// Builds a transport over a fresh `reqwest` client.
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Result<Self, NetworkError> {
        Ok(Self::with_executor(
            Arc::new(ReqwestExecutor::new(timeout)?),
            policy,
        ))
    }

    /// Builds a transport over a custom executor.
    pub fn with_executor(executor: Arc<dyn HttpExecutor>, policy: RetryPolicy) -> Self {
        Self {
            executor,
            policy,
            unauthorized_hook: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Registers the authentication-failed notification.
    pub fn with_unauthorized_hook(mut self, hook: UnauthorizedHook) -> Self {
        self.unauthorized_hook = Some(hook);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn SyncTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Issues the call and returns the response body of a 2xx answer.
    pub async fn request(&self, endpoint: &Endpoint) -> Result<Bytes, NetworkError> {
        let prepared = endpoint.prepare()?;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(
                method = %prepared.method,
                url = %prepared.url,
                headers = ?redact_headers(&prepared.headers),
                attempt,
                "sync HTTP request"
            );

            match self.executor.execute(prepared.clone()).await {
                Ok(response) => return self.classify_status(&prepared, response),
                Err(TransportFailure::Connectivity(cause)) if attempt < max_attempts => {
                    debug!(
                        url = %prepared.url,
                        attempt,
                        error = %cause,
                        "connectivity failure; retrying in {:?}",
                        self.policy.backoff
                    );
                    self.telemetry.on_retry(attempt);
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(TransportFailure::Connectivity(cause)) | Err(TransportFailure::Other(cause)) => {
                    warn!(url = %prepared.url, attempt, error = %cause, "sync HTTP request failed");
                    return Err(NetworkError::Connection(cause));
                }
                Err(TransportFailure::InvalidResponse(cause)) => {
                    return Err(NetworkError::InvalidResponse(cause));
                }
            }
        }
    }

    /// Maps the HTTP status onto the error taxonomy.
    fn classify_status(
        &self,
        prepared: &PreparedRequest,
        response: RawResponse,
    ) -> Result<Bytes, NetworkError> {
        debug!(
            method = %prepared.method,
            url = %prepared.url,
            status = response.status,
            content_length = response.body.len(),
            "sync HTTP response"
        );
        match response.status {
            200..=299 => Ok(response.body),
            401 => {
                warn!(url = %prepared.url, "backend rejected credentials");
                self.telemetry.on_authentication_failed();
                if let Some(hook) = &self.unauthorized_hook {
                    hook();
                }
                Err(NetworkError::InvalidStatusCode {
                    code: 401,
                    body: String::from_utf8_lossy(&response.body).into_owned(),
                })
            }
            code => Err(NetworkError::InvalidStatusCode {
                code,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }),
        }
    }

    /// Issues the call and decodes the JSON body into `T`.
    pub async fn fetch_json<T: DeserializeOwned>(&self, endpoint: &Endpoint) -> Result<T, SyncError> {
        let body = self.request(endpoint).await?;
        serde_json::from_slice(&body).map_err(SyncError::decode)
    }

    /// Issues the call and returns the body as UTF-8 text.
    pub async fn fetch_text(&self, endpoint: &Endpoint) -> Result<String, SyncError> {
        let body = self.request(endpoint).await?;
        String::from_utf8(body.to_vec()).map_err(SyncError::decode)
    }

    /// Issues the call and confirms a 2xx status, discarding the body.
    pub async fn confirm(&self, endpoint: &Endpoint) -> Result<bool, NetworkError> {
        self.request(endpoint).await.map(|_| true)
    }
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "cookie", "x-api-key"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}
