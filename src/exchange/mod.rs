//! Federated client-credentials exchange.
//!
//! Acquire an application token from a tenant token endpoint, authenticating
//! with a managed identity token presented as the client assertion:
//! - `client` performs and caches the grant
//! - `handler` maps requests, tokens and errors onto the HTTP surface

pub mod client;
pub mod config;
pub mod handler;

pub use client::{ClientAssertionSource, TokenExchangeClient};
pub use config::{ExchangeConfig, ExchangeConfigJson};
pub use handler::{ApiError, AppTokenQuery, AppTokenResponse, IdentityTokenQuery, IdentityTokenResponse};
