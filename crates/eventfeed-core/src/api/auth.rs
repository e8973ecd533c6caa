use futures::future::{self, BoxFuture, FutureExt};

use crate::error::FeedError;

/// Supplies the bearer credential attached to every API request.
///
/// Implementations may refresh tokens, so the lookup is asynchronous.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> BoxFuture<'_, Result<String, FeedError>>;
}

/// A fixed token, e.g. taken from configuration
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> BoxFuture<'_, Result<String, FeedError>> {
        if self.0.is_empty() {
            future::ready(Err(FeedError::Auth("no token configured".to_string()))).boxed()
        } else {
            future::ready(Ok(self.0.clone())).boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticToken::new("abc");
        assert_eq!(provider.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_empty_token_is_auth_error() {
        let provider = StaticToken::new("");
        assert!(matches!(provider.token().await, Err(FeedError::Auth(_))));
    }
}
