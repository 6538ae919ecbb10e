//! Error taxonomy for the token exchange.
//!
//! Every failure surfaced by the exchange core is an [`ExchangeError`]. The enum
//! is `Clone` because a single in-flight fetch hands its result to every waiter.

use serde::Serialize;
use std::fmt;

/// Which leg of the exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Minting the client assertion from the managed identity.
    AssertionFetch,
    /// The client-credentials grant at the tenant token endpoint.
    GrantExchange,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::AssertionFetch => write!(f, "assertion fetch"),
            Stage::GrantExchange => write!(f, "grant exchange"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// A required parameter is missing or malformed. Raised before any I/O.
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// The managed identity endpoint is unreachable or returned an error.
    #[error("managed identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// The token endpoint explicitly rejected the client-credentials grant.
    #[error("token endpoint rejected the grant: {error}{}", describe(.description))]
    GrantRejected {
        error: String,
        description: Option<String>,
        error_codes: Vec<i64>,
        correlation_id: Option<String>,
    },

    /// Network-level failure talking to the token endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller cancelled, or the request deadline elapsed.
    #[error("cancelled during {0}")]
    Cancelled(Stage),
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({})", d))
        .unwrap_or_default()
}

impl ExchangeError {
    pub fn invalid_input(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// The stage this error belongs to. `None` for input validation failures.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExchangeError::InvalidInput { .. } => None,
            ExchangeError::IdentityUnavailable(_) => Some(Stage::AssertionFetch),
            ExchangeError::GrantRejected { .. } | ExchangeError::Transport(_) => {
                Some(Stage::GrantExchange)
            }
            ExchangeError::Cancelled(stage) => Some(*stage),
        }
    }

    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::InvalidInput { .. } => "invalid_input",
            ExchangeError::IdentityUnavailable(_) => "identity_unavailable",
            ExchangeError::GrantRejected { .. } => "grant_rejected",
            ExchangeError::Transport(_) => "transport_error",
            ExchangeError::Cancelled(_) => "cancelled",
        }
    }
}

/// Validate a single scope or resource identifier.
pub fn validate_scope(field: &'static str, value: &str) -> Result<(), ExchangeError> {
    if value.trim().is_empty() {
        return Err(ExchangeError::invalid_input(field, "must not be empty"));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ExchangeError::invalid_input(
            field,
            "must be a single scope without whitespace",
        ));
    }
    Ok(())
}
