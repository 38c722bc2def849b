//! Configuration types and utilities

use crate::error::ProxyError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How clients reach the destination through the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Forward proxy. Clients must be configured to use it and must trust its CA.
    Direct,
    /// Transparent front for a single destination origin.
    #[default]
    Reverse,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Direct => "direct",
            ProxyMode::Reverse => "reverse",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(ProxyMode::Direct),
            "reverse" => Ok(ProxyMode::Reverse),
            other => Err(ProxyError::Configuration(format!(
                "Unknown proxy mode '{}', expected 'direct' or 'reverse'",
                other
            ))),
        }
    }
}

/// Where the certificate authority used for TLS interception comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CaSource {
    /// A fixed key/cert pair read from PEM files
    Files { cert: PathBuf, key: PathBuf },
    /// Load `ca.pem`/`ca.key` from the directory, generating them if missing
    Directory { path: PathBuf },
    /// Generated in memory for the lifetime of the proxy
    #[default]
    Ephemeral,
}

/// Limits applied while buffering bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyLimits {
    /// Bodies larger than this are forwarded untouched and never decoded
    pub max_body_bytes: usize,
    /// Overall time allowed to receive one complete body
    pub read_timeout_secs: u64,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024 * 1024,
            read_timeout_secs: 30,
        }
    }
}

impl BodyLimits {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Static proxy configuration.
///
/// Built once through [`ProxyConfig::new`] and the `with_*` methods; the
/// proxy never mutates it after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Origin requests are sent to (reverse) or the service under test (direct)
    pub destination_url: String,
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on; 0 picks a free port at start
    pub listen_port: u16,
    pub mode: ProxyMode,
    /// Display name used in the identity string
    pub name: Option<String>,
    /// Certificate authority used by direct mode
    pub ca: CaSource,
    /// Skip certificate verification on the proxy's own upstream connections.
    /// Nothing else in the process is affected.
    pub accept_invalid_upstream_certs: bool,
    pub body_limits: BodyLimits,
}

impl ProxyConfig {
    /// Create a reverse-mode configuration listening on `127.0.0.1:<port>`.
    pub fn new(destination_url: impl Into<String>, listen_port: u16) -> Self {
        Self {
            destination_url: destination_url.into(),
            listen_address: "127.0.0.1".to_string(),
            listen_port,
            mode: ProxyMode::default(),
            name: None,
            ca: CaSource::default(),
            accept_invalid_upstream_certs: true,
            body_limits: BodyLimits::default(),
        }
    }

    pub fn with_mode(mut self, mode: ProxyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_ca(mut self, ca: CaSource) -> Self {
        self.ca = ca;
        self
    }

    pub fn with_accept_invalid_upstream_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_upstream_certs = accept;
        self
    }

    pub fn with_body_limits(mut self, limits: BodyLimits) -> Self {
        self.body_limits = limits;
        self
    }

    /// Check the destination is an absolute http(s) URL and the listen
    /// address parses.
    pub fn validate(&self) -> Result<()> {
        let destination = url::Url::parse(&self.destination_url).map_err(|e| {
            ProxyError::Configuration(format!(
                "Invalid destination URL '{}': {}",
                self.destination_url, e
            ))
        })?;

        if !matches!(destination.scheme(), "http" | "https") || destination.host_str().is_none() {
            return Err(ProxyError::Configuration(format!(
                "Destination URL '{}' must be an absolute http(s) URL",
                self.destination_url
            )));
        }

        self.listen_address
            .parse::<std::net::IpAddr>()
            .map_err(|e| {
                ProxyError::Configuration(format!(
                    "Invalid listen address '{}': {}",
                    self.listen_address, e
                ))
            })?;

        Ok(())
    }
}
