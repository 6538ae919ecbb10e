//! Federated Token Agent
//!
//! Exchanges the host's managed identity token, presented as a federated
//! client assertion, for application tokens issued by a tenant token endpoint.

mod cache;
mod error;
mod exchange;
mod identity;
mod server;
mod token;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cache::{spawn_cleanup_task, Sweep, DEFAULT_CLEANUP_INTERVAL_SECS};
use exchange::{ExchangeConfig, ExchangeConfigJson, TokenExchangeClient};
use identity::{
    AssertionProvider, IdentityConfig, IdentityConfigJson, IdentitySource, ManagedIdentityProvider,
};
use server::AppState;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "federated-token-agent")]
#[command(about = "Exchanges managed identity tokens for federated application tokens")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7071", env = "AGENT_LISTEN")]
    listen: SocketAddr,

    /// JSON configuration file
    #[arg(long, env = "AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Authority host of the tenant token endpoints
    #[arg(long, env = "AZURE_AUTHORITY_HOST")]
    authority_host: Option<String>,

    /// Client ID of a user-assigned managed identity
    #[arg(long, env = "AZURE_CLIENT_ID")]
    managed_identity_client_id: Option<String>,

    /// Managed identity endpoint (auto, imds, app_service)
    #[arg(long, default_value = "auto", env = "MANAGED_IDENTITY_SOURCE")]
    identity_source: String,

    /// Managed identity endpoint URL override
    #[arg(long, env = "IDENTITY_ENDPOINT")]
    identity_endpoint: Option<String>,

    /// App Service identity header secret
    #[arg(long, env = "IDENTITY_HEADER", hide_env_values = true)]
    identity_header: Option<String>,

    /// Serve raw managed identity tokens on /api/GetManagedIdentityToken
    #[arg(long, env = "EXPOSE_IDENTITY_TOKEN")]
    expose_identity_token: bool,

    /// Deadline for one HTTP request, in seconds
    #[arg(long, default_value_t = 30, env = "REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long, env = "AGENT_VERBOSE")]
    verbose: bool,
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen: SocketAddr,
    pub exchange: ExchangeConfig,
    pub identity: IdentityConfig,
    pub expose_identity_token: bool,
    pub request_timeout_secs: u64,
}

/// JSON configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfigJson {
    #[serde(default)]
    pub exchange: Option<ExchangeConfigJson>,
    #[serde(default)]
    pub identity: Option<IdentityConfigJson>,
    pub expose_identity_token: Option<bool>,
    pub request_timeout_secs: Option<u64>,
}

impl AgentConfigJson {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    fn apply_to(&self, config: &mut AgentConfig) {
        if let Some(ref exchange) = self.exchange {
            exchange.apply_to(&mut config.exchange);
        }
        if let Some(ref identity) = self.identity {
            identity.apply_to(&mut config.identity);
        }
        if let Some(expose) = self.expose_identity_token {
            config.expose_identity_token = expose;
        }
        if let Some(timeout) = self.request_timeout_secs {
            config.request_timeout_secs = timeout;
        }
    }
}

impl AgentConfig {
    fn from_args(args: &Args) -> Result<Self> {
        let source: IdentitySource = args.identity_source.parse().map_err(|e| anyhow!("{}", e))?;

        let mut exchange = ExchangeConfig::default();
        if let Some(ref host) = args.authority_host {
            exchange.authority_host = host.clone();
        }
        exchange.log_exchanges = args.verbose;

        let identity = IdentityConfig {
            source,
            endpoint: args.identity_endpoint.clone(),
            identity_header: args.identity_header.clone(),
            client_id: args.managed_identity_client_id.clone(),
            ..Default::default()
        };

        let mut config = Self {
            listen: args.listen,
            exchange,
            identity,
            expose_identity_token: args.expose_identity_token,
            request_timeout_secs: args.request_timeout_secs,
        };

        if let Some(ref path) = args.config {
            AgentConfigJson::load(path)?.apply_to(&mut config);
            info!(path = ?path, "Applied configuration file");
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.exchange
            .validate()
            .map_err(|e| anyhow!("Invalid exchange configuration: {}", e))?;
        self.identity
            .validate()
            .map_err(|e| anyhow!("Invalid identity configuration: {}", e))?;
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting Federated Token Agent");

    let config = AgentConfig::from_args(&args)?;

    // One HTTP client for both the identity endpoint and the token endpoints
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.exchange.http_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let identity = Arc::new(ManagedIdentityProvider::new(
        http_client.clone(),
        &config.identity,
    ));
    info!(
        endpoint = ?identity.endpoint(),
        user_assigned = config.identity.client_id.is_some(),
        authority_host = %config.exchange.authority_host,
        expose_identity_token = config.expose_identity_token,
        "Configuration loaded"
    );

    let assertions = Arc::new(AssertionProvider::new(identity, &config.identity));
    let exchange = Arc::new(TokenExchangeClient::new(
        http_client,
        config.exchange.clone(),
        assertions.clone(),
    ));

    let shutdown = CancellationToken::new();

    info!("Starting cache cleanup task");
    let caches: Vec<Arc<dyn Sweep>> = vec![
        assertions.cache() as Arc<dyn Sweep>,
        exchange.cache() as Arc<dyn Sweep>,
    ];
    let cleanup_handle = spawn_cleanup_task(caches, DEFAULT_CLEANUP_INTERVAL_SECS, shutdown.clone());

    let state = AppState {
        exchange,
        assertions,
        shutdown: shutdown.clone(),
        request_timeout: Duration::from_secs(config.request_timeout_secs),
    };
    let app = server::router(state, config.expose_identity_token);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(listen = %config.listen, "HTTP server listening");

    tokio::spawn(shutdown_signal(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    if let Err(e) = cleanup_handle.await {
        warn!(error = %e, "Cache cleanup task failed");
    }
    info!("Federated Token Agent stopped");

    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
