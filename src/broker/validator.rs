//! Access token validation run once per connection during the `Connect` handshake.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::utils::error::{MessageRouterError, Result};

/// Decides whether a connecting client may join.
///
/// Called before the client is added to any registry. Returning an error
/// rejects the handshake; the error is reported to the client as
/// `AccessTokenRejected`.
#[async_trait]
pub trait AccessTokenValidator: Send + Sync {
    async fn validate(&self, client_id: &str, access_token: Option<&str>) -> Result<()>;
}

/// Accepts exactly the tokens it was built with.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl AccessTokenValidator for StaticTokenValidator {
    async fn validate(&self, _client_id: &str, access_token: Option<&str>) -> Result<()> {
        match access_token {
            Some(token) if self.tokens.contains(token) => Ok(()),
            Some(_) => Err(MessageRouterError::AccessTokenRejected(
                "unknown access token".to_string(),
            )),
            None => Err(MessageRouterError::AccessTokenRejected(
                "missing access token".to_string(),
            )),
        }
    }
}

/// Plain closures work as validators; the returned string becomes the rejection reason.
#[async_trait]
impl<F> AccessTokenValidator for F
where
    F: Fn(&str, Option<&str>) -> std::result::Result<(), String> + Send + Sync,
{
    async fn validate(&self, client_id: &str, access_token: Option<&str>) -> Result<()> {
        self(client_id, access_token).map_err(MessageRouterError::AccessTokenRejected)
    }
}
