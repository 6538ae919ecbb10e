//! Request and response bodies of the token routes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::client::ExchangeRequest;
use crate::error::{ExchangeError, Stage};
use crate::token::{ApplicationToken, ManagedIdentityToken};

/// Query of `GetAppTokenUsingManagedIdentity`.
///
/// Every field is optional at the extractor level so a missing parameter
/// surfaces as `invalid_input` rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTokenQuery {
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub fed_scope: Option<String>,
    pub scope: Option<String>,
}

impl AppTokenQuery {
    pub fn into_request(self) -> Result<ExchangeRequest, ExchangeError> {
        ExchangeRequest::new(
            self.client_id.unwrap_or_default(),
            self.tenant_id.unwrap_or_default(),
            self.fed_scope.unwrap_or_default(),
            self.scope.unwrap_or_default(),
        )
    }
}

/// Query of `GetManagedIdentityToken`.
#[derive(Debug, Default, Deserialize)]
pub struct IdentityTokenQuery {
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppTokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Remaining lifetime in seconds.
    pub expires_in: i64,
    /// Expiry as a Unix timestamp.
    pub expires_on: i64,
    pub scope: String,
    pub tenant_id: String,
    pub client_id: String,
}

impl AppTokenResponse {
    pub fn new(token: ApplicationToken, now: DateTime<Utc>) -> Self {
        Self {
            expires_in: remaining_secs(token.expires_at, now),
            expires_on: token.expires_at.timestamp(),
            access_token: token.value,
            token_type: token.token_type,
            scope: token.scope,
            tenant_id: token.tenant_id,
            client_id: token.client_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IdentityTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub expires_on: i64,
    pub audience: String,
}

impl IdentityTokenResponse {
    pub fn new(token: ManagedIdentityToken, now: DateTime<Utc>) -> Self {
        Self {
            expires_in: remaining_secs(token.expires_at, now),
            expires_on: token.expires_at.timestamp(),
            access_token: token.value,
            token_type: "Bearer".to_string(),
            audience: token.audience,
        }
    }
}

fn remaining_secs(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_seconds().max(0)
}

/// Error body returned by every token route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// OAuth error code returned by the token endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_codes: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl From<&ExchangeError> for ErrorResponse {
    fn from(err: &ExchangeError) -> Self {
        let mut body = ErrorResponse {
            error: err.code().to_string(),
            error_description: err.to_string(),
            stage: err.stage(),
            provider_error: None,
            error_codes: None,
            correlation_id: None,
        };

        if let ExchangeError::GrantRejected {
            error,
            error_codes,
            correlation_id,
            ..
        } = err
        {
            body.provider_error = Some(error.clone());
            body.error_codes = (!error_codes.is_empty()).then(|| error_codes.clone());
            body.correlation_id = correlation_id.clone();
        }

        body
    }
}

/// [`ExchangeError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ExchangeError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ExchangeError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            ExchangeError::GrantRejected { .. } => StatusCode::UNAUTHORIZED,
            ExchangeError::IdentityUnavailable(_) | ExchangeError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ExchangeError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = %status, error = %self.0, "Token request failed");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}
