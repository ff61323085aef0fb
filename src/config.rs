//! Configuration loading and types for the gateway.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Each subsection governs a different part of the
//! system: networking, authentication, the backing store, and
//! observability.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication / authorization settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Backing object-store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// AWS region to present (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum object size in bytes (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and Kubernetes-style health probes.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/healthz` and `/readyz` probes, and deep `/health` checks.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Authentication settings.
///
/// Field names match `clovisgate.example.yaml`:
/// `auth.access_key` and `auth.secret_key`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Access key (maps to `access_key` in YAML, also accepts `access_key_id`).
    #[serde(alias = "access_key_id", default = "default_access_key")]
    pub access_key: String,

    /// Secret access key (maps to `secret_key` in YAML, also accepts `secret_access_key`).
    #[serde(alias = "secret_access_key", default = "default_secret_key")]
    pub secret_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_key: default_access_key(),
            secret_key: default_secret_key(),
        }
    }
}

/// Backing object-store configuration.
///
/// The backing store serves both the key-value index family and the
/// raw object-container family from the same client, so one section
/// configures both.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend type: `sqlite` (persistent) or `memory` (dev/test).
    #[serde(default = "default_store_engine")]
    pub engine: String,

    /// Path to the SQLite KV database file (used when `engine = "sqlite"`).
    #[serde(default = "default_store_db_path")]
    pub db_path: String,

    /// Root directory object containers are written under (used when
    /// `engine = "sqlite"`).
    #[serde(default = "default_store_objects_root")]
    pub objects_root: String,

    /// Byte threshold (N in the streaming write loop) at which a
    /// buffered-but-not-yet-frozen part body is flushed to the backing
    /// object container.
    #[serde(default = "default_write_payload_threshold")]
    pub write_payload_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: default_store_engine(),
            db_path: default_store_db_path(),
            objects_root: default_store_objects_root(),
            write_payload_threshold: default_write_payload_threshold(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9012
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key() -> String {
    "clovisgate".to_string()
}

fn default_secret_key() -> String {
    "clovisgate-secret".to_string()
}

fn default_store_engine() -> String {
    "sqlite".to_string()
}

fn default_store_db_path() -> String {
    "./data/store.db".to_string()
}

fn default_store_objects_root() -> String {
    "./data/objects".to_string()
}

fn default_write_payload_threshold() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
