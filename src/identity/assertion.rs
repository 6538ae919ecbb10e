//! Client assertions minted from the managed identity.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::IdentityConfig;
use super::provider::IdentityProvider;
use crate::cache::TokenCache;
use crate::error::{validate_scope, ExchangeError, Stage};
use crate::exchange::ClientAssertionSource;
use crate::token::{expiry_from, ClientAssertion, ManagedIdentityToken};

/// Produces managed identity tokens for federation audiences, cached by
/// audience.
pub struct AssertionProvider {
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<TokenCache<String, ManagedIdentityToken>>,
}

impl AssertionProvider {
    pub fn new(identity: Arc<dyn IdentityProvider>, config: &IdentityConfig) -> Self {
        Self {
            identity,
            cache: Arc::new(TokenCache::new(
                "managed_identity",
                Stage::AssertionFetch,
                Duration::from_secs(config.refresh_margin_secs),
                config.max_cached_assertions,
            )),
        }
    }

    /// Get a client assertion whose audience is the federation scope.
    pub async fn get_assertion(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ClientAssertion, ExchangeError> {
        self.get_token(audience, cancel).await.map(ClientAssertion::new)
    }

    /// Get a managed identity token for `audience`.
    pub async fn get_token(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityToken, ExchangeError> {
        validate_scope("audience", audience)?;

        let key = audience.to_string();
        self.cache
            .get_or_fetch(&key, cancel, || self.mint(audience, cancel))
            .await
    }

    /// Handle on the cache, for the cleanup task.
    pub fn cache(&self) -> Arc<TokenCache<String, ManagedIdentityToken>> {
        Arc::clone(&self.cache)
    }

    async fn mint(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityToken, ExchangeError> {
        let issued = self.identity.request_token(audience, cancel).await?;

        // Anchor the expiry at the moment the response arrived.
        let token = ManagedIdentityToken {
            value: issued.token,
            expires_at: expiry_from(Utc::now(), issued.expires_in),
            audience: audience.to_string(),
        };

        if let Some(claims) = token.claims() {
            debug!(
                audience = %audience,
                iss = ?claims.iss,
                sub = ?claims.sub,
                aud = ?claims.aud,
                oid = ?claims.oid,
                tid = ?claims.tid,
                exp = ?claims.exp,
                "Managed identity assertion claims"
            );
        }

        info!(
            audience = %audience,
            expires_at = %token.expires_at,
            "Obtained managed identity token"
        );

        Ok(token)
    }
}

#[async_trait]
impl ClientAssertionSource for AssertionProvider {
    async fn client_assertion(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ClientAssertion, ExchangeError> {
        self.get_assertion(audience, cancel).await
    }

    fn invalidate(&self, audience: &str) {
        if self.cache.invalidate(&audience.to_string()) {
            debug!(audience = %audience, "Dropped cached assertion");
        }
    }
}
