//! caddytail — a Tailscale identity bridge for local web applications.
//!
//! Supervises a Caddy reverse proxy bound to the tailnet, generates its
//! configuration, and resolves the authenticated caller from the identity
//! headers the proxy injects. Framework adapters (see [`adapters`]) wrap
//! the one core contract, [`IdentityExtractor::resolve`].

// Core modules
mod caddyfile;
mod config;
mod identity;
mod supervisor;

// Framework-facing surface
pub mod adapters;

// Re-export key types and functions
pub use caddyfile::{ConfigDocument, generate};
pub use config::{
    ConfigError, DEFAULT_ADMIN_ADDRESS, MIN_UNPRIVILEGED_PORT, ProxyConfig, SupervisorSettings,
};
pub use identity::{
    IdentityExtractor, LOGIN_HEADER, NAME_HEADER, PROFILE_PIC_HEADER, TRUST_MARKER_HEADER,
    TRUST_MARKER_VALUE, TrustContext, UserRecord,
};
pub use supervisor::{CrashError, LifecycleState, ProcessSupervisor, StartupError};

use std::sync::Arc;

/// Convenience bundle tying the pieces together: validated config document,
/// process supervisor and identity extractor.
///
/// Explicitly constructed and explicitly owned — pass it (or its parts) by
/// reference into adapter setup; there is no global instance.
pub struct CaddyTail {
    document: ConfigDocument,
    supervisor: ProcessSupervisor,
    extractor: Arc<IdentityExtractor>,
}

impl CaddyTail {
    /// Validate the config, generate the Caddyfile and set up a supervisor
    /// with default settings.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        Self::with_settings(config, SupervisorSettings::default())
    }

    /// Same as [`CaddyTail::new`] with custom supervisor settings.
    pub fn with_settings(
        config: ProxyConfig,
        settings: SupervisorSettings,
    ) -> Result<Self, ConfigError> {
        let document = caddyfile::generate(&config)?;
        Ok(Self {
            document,
            supervisor: ProcessSupervisor::new(settings),
            extractor: Arc::new(IdentityExtractor::new()),
        })
    }

    /// The generated proxy configuration document.
    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    /// The process supervisor.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// The identity extractor to hand to framework adapters.
    pub fn extractor(&self) -> &Arc<IdentityExtractor> {
        &self.extractor
    }

    /// Start the proxy, drive the application's serving loop, and stop the
    /// proxy on every exit path. See
    /// [`ProcessSupervisor::run_blocking`] for the full contract.
    pub async fn run_blocking<F>(&self, app: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        self.supervisor.run_blocking(&self.document, app).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caddytail_bundles_generated_document() {
        let bridge = CaddyTail::new(ProxyConfig::new("myapp", "example", 10800)).unwrap();
        assert!(
            bridge
                .document()
                .as_str()
                .contains("reverse_proxy localhost:10800")
        );
    }

    #[test]
    fn test_caddytail_surfaces_config_errors() {
        assert!(CaddyTail::new(ProxyConfig::new("", "example", 10800)).is_err());
    }
}
