//! Configuration module for the bootstrap service
//!
//! This module handles loading and parsing configuration from TOML files.
//! Every section is optional; anything left out falls back to the metadata
//! server or to a built-in default.

use crate::backoff::BackoffConfig;
use crate::metadata::RetryPolicy;
use crate::rollout::{RolloutStrategy, MAX_POLL_INTERVAL};
use crate::servicemanagement::DEFAULT_SERVICE_MANAGEMENT_URL;
use crate::token::RefreshPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Upper bound for `metadata.timeout`, in seconds
const MAX_METADATA_TIMEOUT_SECS: u64 = 600;

/// Upper bound for `tokens.identity_token_ttl`, in seconds
const MAX_IDENTITY_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Metadata server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSection {
    /// Base URL; falls back to `GCE_METADATA_HOST`, then the default root
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_metadata_timeout")]
    pub timeout: u64,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retries
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_metadata_timeout() -> u64 {
    crate::util::DEFAULT_RESPONSE_DEADLINE.as_secs()
}

fn default_max_retries() -> u32 {
    3
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: default_metadata_timeout(),
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl MetadataSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout),
            max_retries: self.max_retries,
            backoff: self.backoff,
        }
    }
}

/// Platform configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSection {
    /// Skip probing and use this platform
    #[serde(default, rename = "override")]
    pub platform_override: Option<String>,
}

/// Where the rollout poller reads the current config id from
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RolloutSource {
    /// The instance metadata attribute
    #[default]
    Metadata,
    /// The latest successful rollout in Service Management
    ServiceManagement,
}

/// Rollout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSection {
    /// `fixed` or `managed`; read from metadata when absent
    #[serde(default)]
    pub strategy: Option<String>,
    /// Service name; read from metadata when absent
    #[serde(default)]
    pub service_name: Option<String>,
    /// Initial config id; read from the rollout source when absent
    #[serde(default)]
    pub config_id: Option<String>,
    /// Seconds between rollout polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub source: RolloutSource,
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            strategy: None,
            service_name: None,
            config_id: None,
            poll_interval: default_poll_interval(),
            source: RolloutSource::default(),
        }
    }
}

impl RolloutSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// The configured strategy, parsed
    pub fn parsed_strategy(&self) -> crate::error::Result<Option<RolloutStrategy>> {
        self.strategy.as_deref().map(str::parse).transpose()
    }
}

/// Token refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensSection {
    /// Share of each token's lifetime reserved before expiry
    #[serde(default = "default_safety_fraction")]
    pub safety_fraction: f64,
    /// Minimum reserved time in seconds
    #[serde(default = "default_min_safety_margin")]
    pub min_safety_margin: u64,
    /// Audience for the identity token; no identity token without it
    #[serde(default)]
    pub identity_audience: Option<String>,
    /// Assumed identity token lifetime in seconds
    #[serde(default = "default_identity_token_ttl")]
    pub identity_token_ttl: u64,
}

fn default_safety_fraction() -> f64 {
    0.1
}

fn default_min_safety_margin() -> u64 {
    5
}

fn default_identity_token_ttl() -> u64 {
    3600
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            safety_fraction: default_safety_fraction(),
            min_safety_margin: default_min_safety_margin(),
            identity_audience: None,
            identity_token_ttl: default_identity_token_ttl(),
        }
    }
}

impl TokensSection {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            safety_fraction: self.safety_fraction,
            min_safety_margin: Duration::from_secs(self.min_safety_margin),
            ..RefreshPolicy::default()
        }
    }

    pub fn identity_token_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_token_ttl)
    }
}

/// Service Management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManagementSection {
    #[serde(default = "default_service_management_url")]
    pub url: String,
}

fn default_service_management_url() -> String {
    DEFAULT_SERVICE_MANAGEMENT_URL.to_string()
}

impl Default for ServiceManagementSection {
    fn default() -> Self {
        Self {
            url: default_service_management_url(),
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Main bootstrap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub metadata: MetadataSection,
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub rollout: RolloutSection,
    #[serde(default)]
    pub tokens: TokensSection,
    #[serde(default)]
    pub service_management: ServiceManagementSection,
    #[serde(default)]
    pub server: ServerConfig,
}

impl BootstrapConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: BootstrapConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.metadata.timeout == 0 {
            anyhow::bail!("metadata.timeout must be greater than zero");
        }
        if self.metadata.timeout > MAX_METADATA_TIMEOUT_SECS {
            anyhow::bail!(
                "metadata.timeout must be at most {}s, got {}",
                MAX_METADATA_TIMEOUT_SECS,
                self.metadata.timeout
            );
        }

        if self.rollout.poll_interval == 0 {
            anyhow::bail!("rollout.poll_interval must be greater than zero");
        }
        if self.rollout.poll_interval > MAX_POLL_INTERVAL.as_secs() {
            anyhow::bail!(
                "rollout.poll_interval must be at most {}s, got {}",
                MAX_POLL_INTERVAL.as_secs(),
                self.rollout.poll_interval
            );
        }
        self.rollout.parsed_strategy()?;

        let fraction = self.tokens.safety_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            anyhow::bail!(
                "tokens.safety_fraction must be between 0 and 1 (exclusive), got {}",
                fraction
            );
        }
        if self.tokens.identity_audience.is_some() && self.tokens.identity_token_ttl == 0 {
            anyhow::bail!("tokens.identity_token_ttl must be greater than zero");
        }
        if self.tokens.identity_token_ttl > MAX_IDENTITY_TOKEN_TTL_SECS {
            anyhow::bail!(
                "tokens.identity_token_ttl must be at most {}s, got {}",
                MAX_IDENTITY_TOKEN_TTL_SECS,
                self.tokens.identity_token_ttl
            );
        }

        if self.rollout.source == RolloutSource::ServiceManagement
            && self.service_management.url.trim().is_empty()
        {
            anyhow::bail!("rollout.source = \"service_management\" requires service_management.url");
        }

        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Sample configuration written by `init`
pub const SAMPLE_CONFIG: &str = r#"# Gateway bootstrap configuration

[metadata]
# base_url = "http://metadata.google.internal"
timeout = 15
max_retries = 3

[metadata.backoff]
min_delay_ms = 100
max_delay_ms = 2000
factor = 2.0
jitter_ms = 50

[platform]
# override = "Cloud Run(ESPv2)"

[rollout]
# strategy = "managed"            # fixed or managed; read from metadata when unset
# service_name = "bookstore.endpoints.my-project.cloud.goog"
# config_id = "2024-01-01r0"
poll_interval = 60
source = "metadata"               # metadata or service_management

[tokens]
safety_fraction = 0.1
min_safety_margin = 5
# identity_audience = "https://backend.example.com"
identity_token_ttl = 3600

[service_management]
url = "https://servicemanagement.googleapis.com"

[server]
host = "0.0.0.0"
port = 8090
"#;
