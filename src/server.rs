//! HTTP surface of the agent.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exchange::{
    ApiError, AppTokenQuery, AppTokenResponse, IdentityTokenQuery, IdentityTokenResponse,
    TokenExchangeClient,
};
use crate::identity::AssertionProvider;

pub const APP_TOKEN_PATH: &str = "/api/GetAppTokenUsingManagedIdentity";
/// Same exchange as [`APP_TOKEN_PATH`]; kept for callers of the library-based trigger.
pub const APP_TOKEN_WITH_LIB_PATH: &str = "/api/GetAppTokenUsingManagedIdentityWithLib";
pub const IDENTITY_TOKEN_PATH: &str = "/api/GetManagedIdentityToken";

/// Shared state of the token routes.
#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<TokenExchangeClient>,
    pub assertions: Arc<AssertionProvider>,
    /// Cancelled on process shutdown; every request token is a child of it.
    pub shutdown: CancellationToken,
    pub request_timeout: Duration,
}

impl AppState {
    /// Cancellation token for one request, cancelled after the request
    /// timeout, on shutdown, or when the returned guard is dropped.
    fn request_cancellation(&self) -> (CancellationToken, tokio_util::sync::DropGuard) {
        let cancel = self.shutdown.child_token();
        let deadline = cancel.clone();
        let timeout = self.request_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!(timeout_ms = timeout.as_millis() as u64, "Request deadline elapsed");
                    deadline.cancel();
                }
            }
        });

        let guard = cancel.clone().drop_guard();
        (cancel, guard)
    }
}

/// Build the router. The identity passthrough route is only mounted when
/// `expose_identity_token` is set.
pub fn router(state: AppState, expose_identity_token: bool) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health_check))
        .route(APP_TOKEN_PATH, get(app_token).post(app_token))
        .route(APP_TOKEN_WITH_LIB_PATH, get(app_token).post(app_token));

    if expose_identity_token {
        router = router.route(IDENTITY_TOKEN_PATH, get(identity_token).post(identity_token));
    }

    router.with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn app_token(
    State(state): State<AppState>,
    Query(query): Query<AppTokenQuery>,
) -> Result<Json<AppTokenResponse>, ApiError> {
    let request = query.into_request()?;
    debug!(
        client_id = %request.client_id(),
        tenant_id = %request.tenant_id(),
        federation_scope = %request.federation_scope(),
        scope = %request.scope(),
        "Application token requested"
    );
    let (cancel, _guard) = state.request_cancellation();

    let token = state.exchange.acquire_token(&request, &cancel).await?;

    Ok(Json(AppTokenResponse::new(token, Utc::now())))
}

async fn identity_token(
    State(state): State<AppState>,
    Query(query): Query<IdentityTokenQuery>,
) -> Result<Json<IdentityTokenResponse>, ApiError> {
    let scope = query.scope.unwrap_or_default();
    let (cancel, _guard) = state.request_cancellation();

    let token = state.assertions.get_token(&scope, &cancel).await?;

    info!(audience = %token.audience, "Returning managed identity token");
    Ok(Json(IdentityTokenResponse::new(token, Utc::now())))
}
