//! Token exchange configuration.

use serde::{Deserialize, Serialize};

/// Public cloud authority.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Client-credentials exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    /// Cloud instance base URL. The tenant id is appended as a path segment.
    #[serde(default = "default_authority_host")]
    pub authority_host: String,

    /// Timeout for each outbound HTTP request, in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Application tokens this close to expiry are refreshed before use.
    #[serde(default)]
    pub refresh_margin_secs: u64,

    /// Maximum number of (client, tenant, scope) tokens kept in the cache.
    #[serde(default = "default_max_cached_tokens")]
    pub max_cached_tokens: usize,

    /// Log exchange request details.
    #[serde(default)]
    pub log_exchanges: bool,
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_cached_tokens() -> usize {
    1024
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            authority_host: default_authority_host(),
            http_timeout_secs: default_http_timeout(),
            refresh_margin_secs: 0,
            max_cached_tokens: default_max_cached_tokens(),
            log_exchanges: false,
        }
    }
}

impl ExchangeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let url = url::Url::parse(&self.authority_host)
            .map_err(|e| format!("Invalid authority_host {}: {}", self.authority_host, e))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(format!(
                "authority_host must be an http(s) URL, got {}",
                self.authority_host
            ));
        }
        if url.query().is_some() {
            return Err("authority_host must not contain a query string".to_string());
        }

        if self.http_timeout_secs == 0 {
            return Err("http_timeout_secs must be at least 1".to_string());
        }
        if self.max_cached_tokens == 0 {
            return Err("max_cached_tokens must be at least 1".to_string());
        }

        Ok(())
    }

    /// Token endpoint for a tenant.
    pub fn token_endpoint(&self, tenant_id: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            tenant_id
        )
    }
}

/// JSON configuration overlay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ExchangeConfigJson {
    pub authority_host: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub refresh_margin_secs: Option<u64>,
    pub max_cached_tokens: Option<usize>,
    pub log_exchanges: Option<bool>,
}

impl ExchangeConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut ExchangeConfig) {
        if let Some(ref host) = self.authority_host {
            config.authority_host = host.clone();
        }
        if let Some(timeout) = self.http_timeout_secs {
            config.http_timeout_secs = timeout;
        }
        if let Some(margin) = self.refresh_margin_secs {
            config.refresh_margin_secs = margin;
        }
        if let Some(max) = self.max_cached_tokens {
            config.max_cached_tokens = max;
        }
        if let Some(log) = self.log_exchanges {
            config.log_exchanges = log;
        }
    }
}
