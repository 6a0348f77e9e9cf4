use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};

use async_trait::async_trait;

use crate::error::TokenError;

/// Source of the identity token attached to every remote call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Resolves the current identity token, failing with
    /// [`TokenError::Unauthenticated`] when no session exists.
    async fn id_token(&self) -> Result<String, TokenError>;
}

pub type TokenResolverFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, TokenError>> + Send>> + Send + Sync,
>;

/// Token provider backed by a fixed token or an async resolver.
///
/// The resolver is invoked on every call; identity tokens expire, so nothing
/// is cached here.
#[derive(Clone)]
pub enum TokenFactory {
    Static(String),
    Dynamic { resolver_fn: TokenResolverFn },
    SignedOut,
}

impl TokenFactory {
    pub fn new_from_resolver(resolver_fn: TokenResolverFn) -> Self {
        Self::Dynamic { resolver_fn }
    }

    pub fn new_from_static_token(token: &str) -> Self {
        Self::Static(token.to_string())
    }
}

#[async_trait]
impl TokenProvider for TokenFactory {
    async fn id_token(&self) -> Result<String, TokenError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Dynamic { resolver_fn } => (resolver_fn)().await,
            Self::SignedOut => Err(TokenError::Unauthenticated),
        }
    }
}

impl Debug for TokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenFactory")
    }
}
