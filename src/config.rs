//! Proxy configuration and supervisor tunables.
//!
//! `ProxyConfig` is the typed input to Caddyfile generation; it is validated
//! up front and never silently corrected. `SupervisorSettings` carries the
//! runtime knobs for the process supervisor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lowest port number that does not require elevated privileges to bind.
pub const MIN_UNPRIVILEGED_PORT: u16 = 1024;

/// Default Caddy admin endpoint. The configured value is emitted into the
/// generated Caddyfile and carried on the resulting document, so the
/// supervisor's readiness/stop requests always target the endpoint the
/// proxy actually listens on.
pub const DEFAULT_ADMIN_ADDRESS: &str = "localhost:2019";

fn default_admin_address() -> String {
    DEFAULT_ADMIN_ADDRESS.to_string()
}

/// Configuration for the Caddy reverse proxy in front of the application.
///
/// Immutable once handed to the generator; regenerate and restart the
/// supervisor to apply changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Tailscale hostname for the node (without the tailnet suffix).
    pub hostname: String,
    /// Tailnet name (without the `.ts.net` suffix).
    pub tailnet: String,
    /// Local port the application listens on; Caddy forwards here.
    pub app_port: u16,
    /// URL path-prefix patterns (`/prefix/*`) mapped to local directories
    /// served directly by Caddy. `BTreeMap` keeps generation deterministic.
    #[serde(default)]
    pub static_paths: BTreeMap<String, PathBuf>,
    /// Enable Caddy debug logging in the generated config.
    #[serde(default)]
    pub debug: bool,
    /// Caddy admin endpoint address, emitted into the generated config and
    /// used by the supervisor for readiness polling and graceful stop.
    #[serde(default = "default_admin_address")]
    pub admin_address: String,
}

impl ProxyConfig {
    /// Create a config with no static mappings and debug off.
    pub fn new(hostname: impl Into<String>, tailnet: impl Into<String>, app_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            tailnet: tailnet.into(),
            app_port,
            static_paths: BTreeMap::new(),
            debug: false,
            admin_address: default_admin_address(),
        }
    }

    /// Add a static file mapping from a `/prefix/*` pattern to a directory.
    pub fn with_static_path(
        mut self,
        pattern: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        self.static_paths.insert(pattern.into(), dir.into());
        self
    }

    /// Enable debug logging in the generated config.
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Use a non-default Caddy admin endpoint address.
    pub fn with_admin_address(mut self, address: impl Into<String>) -> Self {
        self.admin_address = address.into();
        self
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// The full site address Caddy serves, e.g. `myapp.example.ts.net`.
    pub fn site_address(&self) -> String {
        format!("{}.{}.ts.net", self.hostname, self.tailnet)
    }

    /// Check all input constraints, reporting the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_label("hostname", &self.hostname)?;
        validate_label("tailnet", &self.tailnet)?;

        if self.app_port < MIN_UNPRIVILEGED_PORT {
            return Err(ConfigError::InvalidPort(self.app_port));
        }

        for (pattern, dir) in &self.static_paths {
            if !pattern.starts_with('/') || !pattern.ends_with("/*") || pattern.len() < 3 {
                return Err(ConfigError::InvalidStaticMapping {
                    pattern: pattern.clone(),
                    reason: "pattern must look like /prefix/*".to_string(),
                });
            }
            // The wildcard is a single trailing segment.
            if pattern[..pattern.len() - 1].contains('*') {
                return Err(ConfigError::InvalidStaticMapping {
                    pattern: pattern.clone(),
                    reason: "only a single trailing wildcard is allowed".to_string(),
                });
            }
            if !dir.is_dir() {
                return Err(ConfigError::InvalidStaticMapping {
                    pattern: pattern.clone(),
                    reason: format!("{} is not an accessible directory", dir.display()),
                });
            }
        }

        Ok(())
    }
}

/// Both hostname and tailnet are DNS labels: letters, digits and hyphens.
fn validate_label(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidHostname {
            field,
            value: value.to_string(),
        })
    }
}

/// Runtime tunables for the process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Path to the Caddy binary.
    pub caddy_binary: PathBuf,
    /// How long `start()` waits for the proxy to report ready.
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,
    /// Interval between readiness probes.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// How long `stop()` waits after a graceful stop request before killing.
    #[serde(with = "duration_millis")]
    pub grace_period: Duration,
    /// How many times a crashed proxy is restarted within one
    /// `run_blocking()` call before the crash is surfaced as fatal.
    pub max_restarts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            caddy_binary: PathBuf::from("caddy"),
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            grace_period: Duration::from_secs(5),
            max_restarts: 0,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Hostname or tailnet is empty or contains characters outside a DNS label
    InvalidHostname { field: &'static str, value: String },
    /// Application port is privileged
    InvalidPort(u16),
    /// Static path pattern malformed or target directory inaccessible
    InvalidStaticMapping { pattern: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHostname { field, value } => {
                write!(f, "Invalid {}: {:?} (expected a DNS label)", field, value)
            }
            Self::InvalidPort(port) => {
                write!(
                    f,
                    "Invalid app_port {}: must be an unprivileged port (>= {})",
                    port, MIN_UNPRIVILEGED_PORT
                )
            }
            Self::InvalidStaticMapping { pattern, reason } => {
                write!(f, "Invalid static mapping {:?}: {}", pattern, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
