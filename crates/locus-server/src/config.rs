//! Daemon configuration.
//!
//! Configuration is layered from:
//! - Built-in defaults
//! - A TOML file (`locus.toml`, `/etc/locus/locus.toml` or `~/.config/locus/locus.toml`)
//! - Environment variables (`LOCUS_*`, nested keys separated by `__`)

use anyhow::{Context, Result};
use locus_core::{AccuracyClass, EngineConfig, StaticAuthorization, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineSection,

    /// Location sources to register.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Caller grants.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// How often dead and expired requests are pruned, in milliseconds.
    #[serde(default = "default_verify_interval")]
    pub verify_interval_ms: u64,

    /// How much newer a coarse fix must be to beat a fine one.
    #[serde(default)]
    pub fine_preference_window_ms: u64,

    /// Maximum number of live requests.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

/// A replayed location source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name.
    pub name: String,

    /// Precision class.
    pub class: AccuracyClass,

    /// Newline-delimited JSON track of samples.
    pub track: PathBuf,

    /// Shortest time between emitted samples, in milliseconds.
    #[serde(default = "default_replay_period")]
    pub min_period_ms: u64,
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Tiers held by callers without a grant.
    #[serde(default = "default_tiers")]
    pub default_tiers: Vec<Tier>,

    /// Per-caller tiers.
    #[serde(default)]
    pub grants: HashMap<String, Vec<Tier>>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_verify_interval() -> u64 {
    5_000
}

fn default_max_requests() -> usize {
    10_000
}

fn default_replay_period() -> u64 {
    1_000
}

fn default_tiers() -> Vec<Tier> {
    vec![Tier::Coarse]
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            engine: EngineSection::default(),
            providers: Vec::new(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            verify_interval_ms: default_verify_interval(),
            fine_preference_window_ms: 0,
            max_requests: default_max_requests(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_tiers: default_tiers(),
            grants: HashMap::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl EngineSection {
    /// Engine configuration for `locus-core`.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_requests: self.max_requests,
            fine_preference_window_ms: self.fine_preference_window_ms,
        }
    }
}

impl AuthConfig {
    /// Build the grant table.
    #[must_use]
    pub fn authorization(&self) -> StaticAuthorization {
        self.grants.iter().fold(
            StaticAuthorization::new().with_default_tiers(self.default_tiers.iter().copied()),
            |auth, (caller, tiers)| auth.grant(caller.as_str(), tiers.iter().copied()),
        )
    }
}

impl Config {
    /// Load configuration from the first file found, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "locus.toml",
            "/etc/locus/locus.toml",
            "~/.config/locus/locus.toml",
        ];

        let file = config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(file.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::layered(Some(path.as_ref()))
    }

    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("LOCUS")
                .separator("__")
                .try_parsing(true),
        );

        let source = match file {
            Some(path) => path.display().to_string(),
            None => "environment".to_string(),
        };
        builder
            .build()
            .and_then(|layered| layered.try_deserialize::<Config>())
            .with_context(|| format!("Failed to load config from {source}"))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}
