//! Error taxonomy shared by the fetch pipeline, the mutation coordinator,
//! the retrying transport, and the realtime hub.
//!
//! Each coordinator applies its own propagation policy on top of these
//! types: the fetch pipeline converts them into a [`crate::fetch::FetchReport`]
//! instead of returning them, the mutation coordinator returns them after a
//! rollback, and the realtime hub delivers them as stream items.

use thiserror::Error;

/// Errors emitted by [`crate::store::LocalStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("local store unavailable: {0}")]
    Unavailable(String),
    /// A field patch targeted a record whose payload is not a JSON object.
    #[error("record {0} does not hold an object payload")]
    InvalidPayload(String),
}

/// Errors raised while resolving an authentication token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No signed-in session is available.
    #[error("no authenticated session")]
    Unauthenticated,
    /// The token resolver failed for another reason.
    #[error("token resolver failed: {0}")]
    Resolver(String),
}

/// Network failures surfaced by [`crate::http::HttpTransport`].
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The endpoint could not be turned into a valid URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The response could not be read.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The backend answered with a non-2xx status.
    #[error("invalid status code {code}: {body}")]
    InvalidStatusCode { code: u16, body: String },
    /// Transport-level failure after retries were exhausted (or not retryable).
    #[error("connection error: {0}")]
    Connection(String),
}

impl NetworkError {
    /// Returns the HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetworkError::InvalidStatusCode { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Failures delivered through realtime subscriptions.
///
/// The type is `Clone` because a single provider error is fanned out to every
/// consumer of a path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// The provider reported an error on the listener.
    #[error("realtime provider error: {0}")]
    Provider(String),
    /// The provider revoked access to the path.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Top-level error type returned by the synchronization layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Reading the local store failed.
    #[error("local read failed: {0}")]
    LocalRead(#[source] StoreError),
    /// Writing the local store failed.
    #[error("local write failed: {0}")]
    LocalWrite(#[source] StoreError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// A payload could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),
    #[error("realtime error: {0}")]
    Realtime(#[from] RealtimeError),
}

impl SyncError {
    /// Builds a decode error from any displayable cause.
    pub fn decode(err: impl std::fmt::Display) -> Self {
        SyncError::Decode(err.to_string())
    }

    /// Returns true when the failure came from token resolution.
    pub fn is_token(&self) -> bool {
        matches!(self, SyncError::Token(_))
    }

    /// Returns true when the backend rejected the credentials (HTTP 401).
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            SyncError::Network(NetworkError::InvalidStatusCode { code: 401, .. })
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
