//! Tamper Agent
//!
//! Runs one interception proxy from command-line or environment
//! configuration, optionally preloaded with a JSON scenario of response
//! patches, until the shutdown signal fires.

use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use tamper_core::{CaSource, HttpProxy, ProxyConfig, ProxyMode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "tamper_core=info,tamper_agent=info";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Backend the proxy forwards to, e.g. http://localhost:3000
    #[arg(long, env = "TAMPER_DESTINATION")]
    pub destination: String,

    /// Port to listen on (0 picks a free port)
    #[arg(long, env = "TAMPER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to listen on
    #[arg(long, env = "TAMPER_LISTEN_ADDR", default_value = "127.0.0.1")]
    pub listen_addr: String,

    /// "reverse" or "direct"
    #[arg(long, env = "TAMPER_MODE", default_value = "reverse")]
    pub mode: ProxyMode,

    /// Name shown in every log line of this proxy
    #[arg(long, env = "TAMPER_NAME")]
    pub name: Option<String>,

    /// Path to the CA certificate (PEM), direct mode
    #[arg(long, env = "TAMPER_CA_CERT", requires = "ca_key", conflicts_with = "ca_dir")]
    pub ca_cert: Option<PathBuf>,

    /// Path to the CA private key (PEM), direct mode
    #[arg(long, env = "TAMPER_CA_KEY", requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// Directory to load the CA from, generated on first use
    #[arg(long, env = "TAMPER_CA_DIR")]
    pub ca_dir: Option<PathBuf>,

    /// JSON file with a list of response patches to register at startup
    #[arg(long, env = "TAMPER_SCENARIO")]
    pub scenario: Option<PathBuf>,

    /// Verify upstream TLS certificates instead of accepting any
    #[arg(long, env = "TAMPER_STRICT_UPSTREAM_TLS")]
    pub strict_upstream_tls: bool,
}

impl Args {
    pub fn ca_source(&self) -> CaSource {
        match (&self.ca_cert, &self.ca_key, &self.ca_dir) {
            (Some(cert), Some(key), _) => CaSource::Files {
                cert: cert.clone(),
                key: key.clone(),
            },
            (_, _, Some(dir)) => CaSource::Directory { path: dir.clone() },
            _ => CaSource::Ephemeral,
        }
    }

    pub fn to_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new(self.destination.clone(), self.port)
            .with_mode(self.mode)
            .with_listen_address(self.listen_addr.clone())
            .with_ca(self.ca_source())
            .with_accept_invalid_upstream_certs(!self.strict_upstream_tls);
        if let Some(name) = &self.name {
            config = config.with_name(name.clone());
        }
        config
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the proxy and register the scenario, without starting it.
pub fn build_proxy(args: &Args) -> Result<HttpProxy, Box<dyn std::error::Error>> {
    let proxy = HttpProxy::new(args.to_config())?;

    if let Some(path) = &args.scenario {
        let scenario = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read scenario {}: {}", path.display(), e))?;
        let ids = proxy.load_scenario(&scenario)?;
        tracing::info!("Scenario {}: {} patches", path.display(), ids.len());
    }

    Ok(proxy)
}

pub async fn run_agent<F>(args: Args, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()>,
{
    tracing::info!("Starting Tamper Agent...");
    tracing::info!("  Destination: {}", args.destination);
    tracing::info!("  Listen:      {}:{}", args.listen_addr, args.port);
    tracing::info!("  Mode:        {}", args.mode);

    let proxy = build_proxy(&args)?;
    proxy.start().await?;
    tracing::info!("Point clients at {}", proxy.client_endpoint_url());

    shutdown.await;
    tracing::info!("Shutdown signal received, stopping {}", proxy);
    proxy.shutdown().await?;

    Ok(())
}
