//! Load balancer configuration.
//!
//! The configuration document is a PascalCase JSON file with a single
//! top-level `LoadBalancer` object. Process-level settings (config file
//! path, log level, reload poll interval) are env-driven.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not parse the configuration document.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The document parsed but violates a constraint.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigDocument {
    pub load_balancer: LoadBalancerOptions,
}

/// Load balancer options (the `LoadBalancer` object).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadBalancerOptions {
    /// Bind address (IP literal).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Bind port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Backend list. Empty is a fatal startup error.
    #[serde(default)]
    pub backends: Vec<BackendOptions>,

    /// Health monitoring options.
    #[serde(default)]
    pub health: HealthOptions,

    /// Connection handling options.
    #[serde(default)]
    pub connection: ConnectionOptions,
}

/// A single backend entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackendOptions {
    /// Display name.
    pub name: String,

    /// Host or IP.
    pub address: String,

    /// Port.
    pub port: u16,

    /// Weight, reserved for weighted selection policies.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Health monitoring options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthOptions {
    #[serde(default)]
    pub passive_monitoring: PassiveMonitoringOptions,
}

/// Passive health monitoring options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassiveMonitoringOptions {
    /// Whether observed outcomes may change backend health state.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures before a backend is marked unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before an unhealthy backend recovers.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Reserved for a time-decayed failure window; counters are
    /// currently unbounded in time.
    #[serde(default = "default_time_window_seconds")]
    pub time_window_seconds: u32,
}

impl Default for PassiveMonitoringOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            time_window_seconds: default_time_window_seconds(),
        }
    }
}

/// Connection handling options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionOptions {
    /// Backend dial deadline in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-read idle deadline in milliseconds. Zero disables it.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    /// Concurrent session cap enforced at accept time.
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: 0,
            max_concurrent_connections: default_max_concurrent_connections(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_time_window_seconds() -> u32 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_max_concurrent_connections() -> usize {
    10000
}

impl LoadBalancerOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address
            .parse::<IpAddr>()
            .map_err(|_| {
                ConfigError::Validation(format!(
                    "ListenAddress '{}' is not an IP literal",
                    self.listen_address
                ))
            })?;

        if self.listen_port == 0 {
            return Err(ConfigError::Validation(
                "ListenPort must be in 1-65535".to_string(),
            ));
        }

        if self.backends.is_empty() {
            return Err(ConfigError::Validation(
                "Backends must contain at least one entry".to_string(),
            ));
        }

        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::Validation(
                    "backend Name must not be empty".to_string(),
                ));
            }
            if backend.address.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' has an empty Address",
                    backend.name
                )));
            }
            if backend.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' Port must be in 1-65535",
                    backend.name
                )));
            }
            if backend.weight == 0 {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' Weight must be >= 1",
                    backend.name
                )));
            }
        }

        let passive = &self.health.passive_monitoring;
        if passive.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "FailureThreshold must be >= 1".to_string(),
            ));
        }
        if passive.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "SuccessThreshold must be >= 1".to_string(),
            ));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "ConnectTimeoutMs must be >= 1".to_string(),
            ));
        }
        if self.connection.max_concurrent_connections == 0 {
            return Err(ConfigError::Validation(
                "MaxConcurrentConnections must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The socket address to bind the listener on.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.listen_address.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "ListenAddress '{}' is not an IP literal",
                self.listen_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Backend dial deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    /// Per-read idle deadline, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.connection.idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Load and validate options from a JSON config file.
pub fn load_from_file(path: &Path) -> Result<LoadBalancerOptions, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let document: ConfigDocument =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let options = document.load_balancer;
    options.validate()?;
    Ok(options)
}

/// Process-level settings (env-driven).
#[derive(Debug, Clone)]
pub struct ProcessEnv {
    /// Path to the JSON configuration file.
    pub config_path: PathBuf,

    /// Interval between config file mtime checks.
    pub reload_poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl ProcessEnv {
    /// Load process settings from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let config_path = std::env::var("TCPLB_CONFIG")
            .unwrap_or_else(|_| "config.json".to_string())
            .into();

        let reload_poll_interval_ms: u64 = std::env::var("TCPLB_RELOAD_POLL_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("TCPLB_RELOAD_POLL_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let reload_poll_interval = Duration::from_millis(reload_poll_interval_ms.max(100));

        let log_level = std::env::var("TCPLB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            config_path,
            reload_poll_interval,
            log_level,
        })
    }
}
