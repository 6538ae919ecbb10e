//! OAuth2 client-credentials grant with a federated client assertion.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ExchangeConfig;
use crate::cache::TokenCache;
use crate::error::{validate_scope, ExchangeError, Stage};
use crate::token::{deserialize_seconds, expiry_from, ApplicationToken, ClientAssertion};

/// Client assertion type for a JWT bearer assertion (RFC 7523).
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub const GRANT_TYPE_CLIENT_CREDENTIALS: &str = "client_credentials";

/// Header carrying a per-request correlation id to the token endpoint.
const CLIENT_REQUEST_ID: &str = "client-request-id";

/// Capability to mint a client assertion on demand.
///
/// Called only while building a token request, never at construction time.
#[async_trait]
pub trait ClientAssertionSource: Send + Sync {
    async fn client_assertion(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ClientAssertion, ExchangeError>;

    /// Forget any cached assertion for `audience`.
    fn invalidate(&self, _audience: &str) {}
}

/// The caller-supplied exchange parameters. All four are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    client_id: String,
    tenant_id: String,
    federation_scope: String,
    scope: String,
}

impl ExchangeRequest {
    pub fn new(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        federation_scope: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self, ExchangeError> {
        let request = Self {
            client_id: client_id.into(),
            tenant_id: tenant_id.into(),
            federation_scope: federation_scope.into(),
            scope: scope.into(),
        };

        if request.client_id.trim().is_empty() {
            return Err(ExchangeError::invalid_input("clientId", "must not be empty"));
        }
        if request.client_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ExchangeError::invalid_input(
                "clientId",
                "must not contain whitespace",
            ));
        }
        validate_tenant(&request.tenant_id)?;
        validate_scope("fedScope", &request.federation_scope)?;
        if request.scope.trim().is_empty() {
            return Err(ExchangeError::invalid_input("scope", "must not be empty"));
        }
        if request.scope.chars().any(char::is_control) {
            return Err(ExchangeError::invalid_input(
                "scope",
                "must not contain control characters",
            ));
        }

        Ok(request)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn federation_scope(&self) -> &str {
        &self.federation_scope
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn cache_key(&self) -> TokenCacheKey {
        TokenCacheKey {
            client_id: self.client_id.clone(),
            tenant_id: self.tenant_id.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Tenant id is a path segment of the token endpoint: a GUID or a domain.
fn validate_tenant(tenant_id: &str) -> Result<(), ExchangeError> {
    if tenant_id.is_empty() {
        return Err(ExchangeError::invalid_input("tenantId", "must not be empty"));
    }
    let valid = tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if !valid || tenant_id.starts_with('.') {
        return Err(ExchangeError::invalid_input(
            "tenantId",
            "must be a tenant GUID or domain name",
        ));
    }
    Ok(())
}

/// Application tokens are cached per (client, tenant, scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    client_id: String,
    tenant_id: String,
    scope: String,
}

#[derive(Serialize)]
struct ClientCredentialsForm<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    scope: &'a str,
    client_assertion_type: &'a str,
    client_assertion: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth2 error body (RFC 6749 §5.2) plus the Entra ID extensions.
#[derive(Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_codes: Vec<i64>,
    #[serde(default)]
    correlation_id: Option<String>,
}

/// Completes client-credentials grants using a federated client assertion.
pub struct TokenExchangeClient {
    http_client: reqwest::Client,
    config: ExchangeConfig,
    assertions: Arc<dyn ClientAssertionSource>,
    cache: Arc<TokenCache<TokenCacheKey, ApplicationToken>>,
}

impl TokenExchangeClient {
    /// No network activity happens here; assertions are minted on first use.
    pub fn new(
        http_client: reqwest::Client,
        config: ExchangeConfig,
        assertions: Arc<dyn ClientAssertionSource>,
    ) -> Self {
        let cache = Arc::new(TokenCache::new(
            "application",
            Stage::GrantExchange,
            Duration::from_secs(config.refresh_margin_secs),
            config.max_cached_tokens,
        ));

        Self {
            http_client,
            config,
            assertions,
            cache,
        }
    }

    /// Acquire an application token, from cache when a live one exists.
    pub async fn acquire_token(
        &self,
        request: &ExchangeRequest,
        cancel: &CancellationToken,
    ) -> Result<ApplicationToken, ExchangeError> {
        let key = request.cache_key();
        self.cache
            .get_or_fetch(&key, cancel, || self.exchange(request, cancel))
            .await
    }

    /// Handle on the cache, for the cleanup task.
    pub fn cache(&self) -> Arc<TokenCache<TokenCacheKey, ApplicationToken>> {
        Arc::clone(&self.cache)
    }

    async fn exchange(
        &self,
        request: &ExchangeRequest,
        cancel: &CancellationToken,
    ) -> Result<ApplicationToken, ExchangeError> {
        let endpoint = self.config.token_endpoint(&request.tenant_id);

        let assertion = self
            .assertions
            .client_assertion(&request.federation_scope, cancel)
            .await?;

        let form = ClientCredentialsForm {
            grant_type: GRANT_TYPE_CLIENT_CREDENTIALS,
            client_id: &request.client_id,
            scope: &request.scope,
            client_assertion_type: CLIENT_ASSERTION_TYPE_JWT_BEARER,
            client_assertion: assertion.value(),
        };
        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| ExchangeError::Transport(format!("Failed to encode token request: {}", e)))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        if self.config.log_exchanges {
            debug!(
                endpoint = %endpoint,
                client_id = %request.client_id,
                scope = %request.scope,
                federation_scope = %request.federation_scope,
                assertion_audience = %assertion.audience(),
                assertion_expires_at = %assertion.expires_at(),
                request_id = %request_id,
                "Requesting application token"
            );
        }

        let response = self
            .http_client
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .header(CLIENT_REQUEST_ID, &request_id)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                ExchangeError::Transport(format!("Failed to reach token endpoint: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ExchangeError::Transport(format!("Failed to read token response: {}", e))
        })?;
        let received_at = Utc::now();

        if !status.is_success() {
            let err = classify_failure(status, &body);
            if let ExchangeError::GrantRejected {
                ref error,
                ref correlation_id,
                ..
            } = err
            {
                warn!(
                    status = %status,
                    error = %error,
                    client_id = %request.client_id,
                    tenant_id = %request.tenant_id,
                    correlation_id = ?correlation_id,
                    request_id = %request_id,
                    "Token endpoint rejected the grant"
                );
                // A caller retry should present a freshly minted assertion.
                self.assertions.invalidate(&request.federation_scope);
            } else {
                warn!(status = %status, request_id = %request_id, "Token endpoint failed");
            }
            return Err(err);
        }

        let payload: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Transport(format!("Malformed token response: {}", e))
        })?;
        let expires_in = payload.expires_in.ok_or_else(|| {
            ExchangeError::Transport("Token response is missing expires_in".to_string())
        })?;

        let token = ApplicationToken {
            value: payload.access_token,
            token_type: payload.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: expiry_from(received_at, Duration::from_secs(expires_in)),
            scope: payload.scope.unwrap_or_else(|| request.scope.clone()),
            tenant_id: request.tenant_id.clone(),
            client_id: request.client_id.clone(),
        };

        info!(
            client_id = %token.client_id,
            tenant_id = %token.tenant_id,
            scope = %token.scope,
            expires_at = %token.expires_at,
            "Application token acquired"
        );

        Ok(token)
    }
}

/// Map a non-success token endpoint response to an error.
///
/// A 4xx with an OAuth error body is an explicit rejection; server errors and
/// bodies that are not OAuth errors are transport failures.
fn classify_failure(status: reqwest::StatusCode, body: &str) -> ExchangeError {
    if status.is_client_error() {
        if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(body) {
            return ExchangeError::GrantRejected {
                error: oauth.error,
                description: oauth.error_description,
                error_codes: oauth.error_codes,
                correlation_id: oauth.correlation_id,
            };
        }
    }

    let snippet: String = body.chars().take(512).collect();
    ExchangeError::Transport(format!("Token endpoint returned {}: {}", status, snippet))
}
