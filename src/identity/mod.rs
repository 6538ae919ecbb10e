//! Managed identity as the source of federated client assertions.
//!
//! The managed identity endpoint issues a token for the federation audience;
//! the token is then presented as the `client_assertion` of a
//! client-credentials grant.

pub mod assertion;
pub mod config;
pub mod provider;

pub use assertion::AssertionProvider;
pub use config::{IdentityConfig, IdentityConfigJson, IdentitySource};
pub use provider::ManagedIdentityProvider;
