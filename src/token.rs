//! Token types shared by the assertion provider and the exchange client.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;

/// Anything the token cache can hold.
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;
}

/// Compute an absolute expiry from a relative lifetime, anchored at `now`.
pub fn expiry_from(now: DateTime<Utc>, expires_in: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expires_in)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A bearer token issued by the managed identity for one audience.
#[derive(Clone, PartialEq, Eq)]
pub struct ManagedIdentityToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub audience: String,
}

impl ManagedIdentityToken {
    /// Unverified claims of the token, if it is a JWT.
    pub fn claims(&self) -> Option<AssertionClaims> {
        AssertionClaims::peek(&self.value)
    }
}

impl Expiring for ManagedIdentityToken {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for ManagedIdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedIdentityToken")
            .field("value", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("audience", &self.audience)
            .finish()
    }
}

/// A managed identity token acting as the signed client assertion.
///
/// The audience is always the federation scope. Kept as a separate type so an
/// assertion can never be handed back where an application token is expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAssertion(ManagedIdentityToken);

impl ClientAssertion {
    pub fn new(token: ManagedIdentityToken) -> Self {
        Self(token)
    }

    pub fn value(&self) -> &str {
        &self.0.value
    }

    pub fn audience(&self) -> &str {
        &self.0.audience
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.0.expires_at
    }
}

/// An access token issued for the application by the tenant token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ApplicationToken {
    pub value: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub tenant_id: String,
    pub client_id: String,
}

impl Expiring for ApplicationToken {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for ApplicationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationToken")
            .field("value", &"[redacted]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Claims of interest when diagnosing a federated credential binding.
///
/// The federated credential on the app registration matches on `iss` and
/// `sub`, so these are what an operator needs to compare.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssertionClaims {
    pub iss: Option<String>,
    pub sub: Option<String>,
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    pub oid: Option<String>,
    pub tid: Option<String>,
    pub exp: Option<i64>,
}

impl AssertionClaims {
    /// Decode the payload without verifying anything. Diagnostics only.
    pub fn peek(token: &str) -> Option<Self> {
        let header = jsonwebtoken::decode_header(token).ok()?;
        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<AssertionClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .map(|data| data.claims)
    }
}

/// Deserialize a lifetime/timestamp that may arrive as a JSON number or a
/// numeric string (the managed identity endpoints send strings).
pub fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(n)) => Ok(Some(n)),
        Some(Seconds::Text(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid seconds value {:?}: {}", s, e))),
    }
}
