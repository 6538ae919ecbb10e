//! Managed identity token source.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::config::{IdentityConfig, ResolvedEndpoint};
use crate::error::{ExchangeError, Stage};
use crate::token::deserialize_seconds;

const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// A token as returned by the identity provider, before it is stamped with an
/// absolute expiry.
pub struct ProviderToken {
    pub token: String,
    pub expires_in: Duration,
}

impl std::fmt::Debug for ProviderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderToken")
            .field("token", &"[redacted]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Source of managed identity tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Request a token for `audience` using the ambient managed identity.
    async fn request_token(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderToken, ExchangeError>;
}

/// Convert an OAuth2 scope to the resource the managed identity endpoints
/// expect (`api://AzureADTokenExchange/.default` → `api://AzureADTokenExchange`).
pub fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[derive(Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    expires_in: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    expires_on: Option<u64>,
}

impl ManagedIdentityResponse {
    fn lifetime(&self) -> Option<Duration> {
        if let Some(secs) = self.expires_in {
            return Some(Duration::from_secs(secs));
        }
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        self.expires_on
            .map(|on| Duration::from_secs(on.saturating_sub(now)))
    }
}

/// Calls the platform managed identity endpoint over HTTP.
pub struct ManagedIdentityProvider {
    http_client: reqwest::Client,
    endpoint: ResolvedEndpoint,
    client_id: Option<String>,
}

impl ManagedIdentityProvider {
    pub fn new(http_client: reqwest::Client, config: &IdentityConfig) -> Self {
        Self {
            http_client,
            endpoint: config.resolve(),
            client_id: config.client_id.clone(),
        }
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    fn build_request(&self, resource: &str) -> Result<reqwest::RequestBuilder, ExchangeError> {
        let (base, api_version) = match &self.endpoint {
            ResolvedEndpoint::Imds { url } => (url, IMDS_API_VERSION),
            ResolvedEndpoint::AppService { url, .. } => (url, APP_SERVICE_API_VERSION),
        };

        let mut url = Url::parse(base).map_err(|e| {
            ExchangeError::IdentityUnavailable(format!("Invalid managed identity endpoint: {}", e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", api_version);
            query.append_pair("resource", resource);
            if let Some(ref client_id) = self.client_id {
                query.append_pair("client_id", client_id);
            }
        }

        let request = self.http_client.get(url);
        Ok(match &self.endpoint {
            ResolvedEndpoint::Imds { .. } => request.header("Metadata", "true"),
            ResolvedEndpoint::AppService { header, .. } => {
                request.header("X-IDENTITY-HEADER", header.as_str())
            }
        })
    }

    async fn fetch(&self, audience: &str) -> Result<ProviderToken, ExchangeError> {
        let resource = scope_to_resource(audience);
        let request = self.build_request(resource)?;

        debug!(
            resource = %resource,
            endpoint = ?self.endpoint,
            user_assigned = self.client_id.is_some(),
            "Requesting managed identity token"
        );

        let response = request.send().await.map_err(|e| {
            ExchangeError::IdentityUnavailable(format!(
                "Failed to reach managed identity endpoint (is a managed identity available on this host?): {}",
                e
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, resource = %resource, "Managed identity endpoint returned an error");
            return Err(ExchangeError::IdentityUnavailable(format!(
                "Managed identity endpoint returned {}: {}",
                status, body
            )));
        }

        let payload: ManagedIdentityResponse = response.json().await.map_err(|e| {
            ExchangeError::IdentityUnavailable(format!("Invalid managed identity response: {}", e))
        })?;

        let expires_in = payload.lifetime().ok_or_else(|| {
            ExchangeError::IdentityUnavailable(
                "Managed identity response has neither expires_in nor expires_on".to_string(),
            )
        })?;

        Ok(ProviderToken {
            token: payload.access_token,
            expires_in,
        })
    }
}

#[async_trait]
impl IdentityProvider for ManagedIdentityProvider {
    async fn request_token(
        &self,
        audience: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderToken, ExchangeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled(Stage::AssertionFetch)),
            result = self.fetch(audience) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::config::IdentitySource;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn imds_config(server: &MockServer) -> IdentityConfig {
        IdentityConfig {
            source: IdentitySource::Imds,
            endpoint: Some(format!("{}/metadata/identity/oauth2/token", server.uri())),
            ..Default::default()
        }
    }

    #[test]
    fn test_scope_to_resource() {
        assert_eq!(
            scope_to_resource("api://AzureADTokenExchange/.default"),
            "api://AzureADTokenExchange"
        );
        assert_eq!(
            scope_to_resource("https://management.azure.com/"),
            "https://management.azure.com/"
        );
    }

    #[tokio::test]
    async fn test_imds_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(query_param("api-version", "2018-02-01"))
            .and(query_param("resource", "api://AzureADTokenExchange"))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "mi-token",
                "expires_in": "3599",
                "expires_on": "1700003599",
                "resource": "api://AzureADTokenExchange",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = ManagedIdentityProvider::new(reqwest::Client::new(), &imds_config(&server));
        let token = provider
            .request_token("api://AzureADTokenExchange/.default", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(token.token, "mi-token");
        assert_eq!(token.expires_in, Duration::from_secs(3599));
    }

    #[tokio::test]
    async fn test_app_service_request_with_user_assigned_identity() {
        let server = MockServer::start().await;
        let expires_on = Utc::now().timestamp() + 1800;
        Mock::given(method("GET"))
            .and(path("/msi/token"))
            .and(query_param("api-version", "2019-08-01"))
            .and(query_param("resource", "api://AzureADTokenExchange"))
            .and(query_param("client_id", "user-assigned-id"))
            .and(header("X-IDENTITY-HEADER", "secret-header"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "app-service-token",
                "expires_on": expires_on.to_string(),
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = IdentityConfig {
            endpoint: Some(format!("{}/msi/token", server.uri())),
            identity_header: Some("secret-header".to_string()),
            client_id: Some("user-assigned-id".to_string()),
            ..Default::default()
        };
        let provider = ManagedIdentityProvider::new(reqwest::Client::new(), &config);
        let token = provider
            .request_token("api://AzureADTokenExchange/.default", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(token.token, "app-service-token");
        let secs = token.expires_in.as_secs();
        assert!((1795..=1800).contains(&secs), "unexpected lifetime {}", secs);
    }

    #[tokio::test]
    async fn test_error_status_is_identity_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_request",
                "error_description": "Identity not found"
            })))
            .mount(&server)
            .await;

        let provider = ManagedIdentityProvider::new(reqwest::Client::new(), &imds_config(&server));
        let err = provider
            .request_token("fed-scope", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ExchangeError::IdentityUnavailable(msg) => assert!(msg.contains("Identity not found")),
            other => panic!("Expected IdentityUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_identity_unavailable() {
        let config = IdentityConfig {
            source: IdentitySource::Imds,
            // Port 1 on loopback refuses connections.
            endpoint: Some("http://127.0.0.1:1/metadata/identity/oauth2/token".to_string()),
            ..Default::default()
        };
        let provider = ManagedIdentityProvider::new(reqwest::Client::new(), &config);
        let err = provider
            .request_token("fed-scope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::IdentityUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_lifetime_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "mi-token" })),
            )
            .mount(&server)
            .await;

        let provider = ManagedIdentityProvider::new(reqwest::Client::new(), &imds_config(&server));
        let err = provider
            .request_token("fed-scope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::IdentityUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "t", "expires_in": 60 }))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let provider = ManagedIdentityProvider::new(reqwest::Client::new(), &imds_config(&server));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            provider.request_token("fed-scope", &cancel),
        )
        .await
        .expect("cancellation should abort the request")
        .unwrap_err();
        assert_eq!(err, ExchangeError::Cancelled(Stage::AssertionFetch));
    }

    #[test]
    fn test_provider_token_debug_redacts_value() {
        let token = ProviderToken {
            token: "mi-secret".to_string(),
            expires_in: Duration::from_secs(3600),
        };
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("mi-secret"));
        assert!(rendered.contains("3600"));
    }
}
