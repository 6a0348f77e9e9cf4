//! Authenticated remote calls.
//!
//! [`RemoteFetcher`] resolves the identity token, attaches it as a bearer
//! credential and hands the request to the retrying transport. A token
//! failure short-circuits before anything reaches the network.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SyncError;
use crate::http::{Endpoint, HttpTransport};
use crate::token::TokenProvider;

/// Builds one authenticated request per logical resource.
#[derive(Clone)]
pub struct RemoteFetcher {
    tokens: Arc<dyn TokenProvider>,
    transport: HttpTransport,
}

impl std::fmt::Debug for RemoteFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFetcher")
            .field("transport", &self.transport)
            .finish()
    }
}

impl RemoteFetcher {
    pub fn new(tokens: Arc<dyn TokenProvider>, transport: HttpTransport) -> Self {
        Self { tokens, transport }
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Returns a copy of `endpoint` carrying the current identity token.
    pub async fn authorize(&self, endpoint: &Endpoint) -> Result<Endpoint, SyncError> {
        let token = self.tokens.id_token().await.map_err(|err| {
            debug!(path = %endpoint.path, error = %err, "token resolution failed");
            SyncError::Token(err)
        })?;
        Ok(endpoint.clone().with_bearer(&token)?)
    }

    /// Fetches and decodes a JSON resource.
    pub async fn fetch<T: DeserializeOwned>(&self, endpoint: &Endpoint) -> Result<T, SyncError> {
        let endpoint = self.authorize(endpoint).await?;
        self.transport.fetch_json(&endpoint).await
    }

    /// Fetches a resource as text.
    pub async fn fetch_text(&self, endpoint: &Endpoint) -> Result<String, SyncError> {
        let endpoint = self.authorize(endpoint).await?;
        self.transport.fetch_text(&endpoint).await
    }

    /// Issues a write and confirms the backend accepted it.
    pub async fn confirm(&self, endpoint: &Endpoint) -> Result<bool, SyncError> {
        let endpoint = self.authorize(endpoint).await?;
        Ok(self.transport.confirm(&endpoint).await?)
    }
}
