//! Managed identity configuration.

use serde::{Deserialize, Serialize};

/// Default IMDS token endpoint.
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Which managed identity endpoint to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// App Service when its endpoint and header are known, IMDS otherwise.
    #[default]
    Auto,
    /// Instance Metadata Service (VMs, AKS, container instances).
    Imds,
    /// App Service / Functions identity endpoint.
    AppService,
}

impl std::str::FromStr for IdentitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(IdentitySource::Auto),
            "imds" => Ok(IdentitySource::Imds),
            "app_service" | "appservice" => Ok(IdentitySource::AppService),
            other => Err(format!(
                "Unknown identity source: {}. Valid: auto, imds, app_service",
                other
            )),
        }
    }
}

/// Managed identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Endpoint selection.
    #[serde(default)]
    pub source: IdentitySource,

    /// Endpoint URL override. For App Service this is `IDENTITY_ENDPOINT`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// App Service identity secret (`IDENTITY_HEADER`).
    #[serde(default)]
    pub identity_header: Option<String>,

    /// Client ID of a user-assigned identity. System-assigned when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Assertions this close to expiry are refreshed before use.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,

    /// Maximum number of federation audiences kept in the cache.
    #[serde(default = "default_max_cached_assertions")]
    pub max_cached_assertions: usize,
}

fn default_refresh_margin() -> u64 {
    300 // 5 minutes
}

fn default_max_cached_assertions() -> usize {
    64
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            source: IdentitySource::Auto,
            endpoint: None,
            identity_header: None,
            client_id: None,
            refresh_margin_secs: default_refresh_margin(),
            max_cached_assertions: default_max_cached_assertions(),
        }
    }
}

/// A fully resolved endpoint to call.
#[derive(Clone, PartialEq, Eq)]
pub enum ResolvedEndpoint {
    Imds { url: String },
    AppService { url: String, header: String },
}

impl std::fmt::Debug for ResolvedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedEndpoint::Imds { url } => f.debug_struct("Imds").field("url", url).finish(),
            ResolvedEndpoint::AppService { url, .. } => f
                .debug_struct("AppService")
                .field("url", url)
                .field("header", &"[redacted]")
                .finish(),
        }
    }
}

impl IdentityConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref endpoint) = self.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| format!("Invalid managed identity endpoint {}: {}", endpoint, e))?;
        }

        if self.source == IdentitySource::AppService && self.identity_header.is_none() {
            return Err("App Service managed identity requires identity_header".to_string());
        }
        if self.source == IdentitySource::AppService && self.endpoint.is_none() {
            return Err("App Service managed identity requires endpoint".to_string());
        }

        if self.max_cached_assertions == 0 {
            return Err("max_cached_assertions must be at least 1".to_string());
        }

        Ok(())
    }

    /// Decide which endpoint to call.
    pub fn resolve(&self) -> ResolvedEndpoint {
        let app_service = match (self.source, &self.endpoint, &self.identity_header) {
            (IdentitySource::Imds, _, _) => None,
            (_, Some(url), Some(header)) => Some((url.clone(), header.clone())),
            _ => None,
        };

        match app_service {
            Some((url, header)) => ResolvedEndpoint::AppService { url, header },
            None => ResolvedEndpoint::Imds {
                url: self
                    .endpoint
                    .clone()
                    .filter(|_| self.source != IdentitySource::AppService)
                    .unwrap_or_else(|| IMDS_ENDPOINT.to_string()),
            },
        }
    }
}

/// JSON configuration overlay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityConfigJson {
    pub source: Option<IdentitySource>,
    pub endpoint: Option<String>,
    pub identity_header: Option<String>,
    pub client_id: Option<String>,
    pub refresh_margin_secs: Option<u64>,
    pub max_cached_assertions: Option<usize>,
}

impl IdentityConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut IdentityConfig) {
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(ref endpoint) = self.endpoint {
            config.endpoint = Some(endpoint.clone());
        }
        if let Some(ref header) = self.identity_header {
            config.identity_header = Some(header.clone());
        }
        if let Some(ref client_id) = self.client_id {
            config.client_id = Some(client_id.clone());
        }
        if let Some(margin) = self.refresh_margin_secs {
            config.refresh_margin_secs = margin;
        }
        if let Some(max) = self.max_cached_assertions {
            config.max_cached_assertions = max;
        }
    }
}
