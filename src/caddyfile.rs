//! Caddyfile generation.
//!
//! Turns a validated [`ProxyConfig`] into the Caddyfile the supervisor hands
//! to the Caddy process. Generation is a pure transformation: same input,
//! byte-identical output. Writing the document to disk is the supervisor's
//! responsibility.

use crate::config::{ConfigError, ProxyConfig};
use crate::identity::{
    LOGIN_HEADER, NAME_HEADER, PROFILE_PIC_HEADER, TRUST_MARKER_HEADER, TRUST_MARKER_VALUE,
};

/// A generated Caddyfile, ready to be written and applied.
///
/// Carries the admin endpoint address emitted into the `admin` directive,
/// so the supervisor polls and stops exactly the endpoint the proxy was
/// configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    text: String,
    admin_address: String,
}

impl ConfigDocument {
    /// Get the document text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Consume and return the document text.
    pub fn into_inner(self) -> String {
        self.text
    }

    /// The admin endpoint address this document configures Caddy with.
    pub fn admin_address(&self) -> &str {
        &self.admin_address
    }

    /// URL polled until the proxy reports ready.
    pub fn readiness_url(&self) -> String {
        format!("http://{}/config/", self.admin_address)
    }

    /// URL for a graceful stop request against the admin endpoint.
    pub fn stop_url(&self) -> String {
        format!("http://{}/stop", self.admin_address)
    }
}

impl std::fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Generate the Caddyfile for a proxy configuration.
///
/// Validates the config first and fails with [`ConfigError`] on any
/// constraint violation; no document is produced in that case.
pub fn generate(config: &ProxyConfig) -> Result<ConfigDocument, ConfigError> {
    config.validate()?;

    let mut out = String::new();

    // Global options. Tailscale terminates TLS on the tailnet, so Caddy's
    // automatic HTTPS stays out of the way.
    out.push_str("{\n");
    out.push_str(&format!("\tadmin {}\n", config.admin_address));
    out.push_str("\tauto_https off\n");
    if config.debug {
        out.push_str("\tdebug\n");
    }
    out.push_str("}\n\n");

    out.push_str(&format!("https://{} {{\n", config.site_address()));
    out.push_str(&format!("\tbind tailscale/{}\n", config.hostname));
    out.push_str("\ttailscale_auth\n");

    // Static mappings before the catch-all reverse proxy. BTreeMap iteration
    // keeps the emitted order stable.
    for (pattern, dir) in &config.static_paths {
        out.push('\n');
        out.push_str(&format!("\thandle_path {} {{\n", pattern));
        out.push_str(&format!("\t\troot * {}\n", dir.display()));
        out.push_str("\t\tfile_server\n");
        out.push_str("\t}\n");
    }

    out.push('\n');
    out.push_str(&format!(
        "\treverse_proxy localhost:{} {{\n",
        config.app_port
    ));
    // Drop any client-supplied identity headers before injecting the real
    // ones from the Tailscale auth placeholders.
    for header in [
        LOGIN_HEADER,
        NAME_HEADER,
        PROFILE_PIC_HEADER,
        TRUST_MARKER_HEADER,
    ] {
        out.push_str(&format!("\t\theader_up -{}\n", header));
    }
    out.push_str(&format!(
        "\t\theader_up {} {{http.auth.user.id}}\n",
        LOGIN_HEADER
    ));
    out.push_str(&format!(
        "\t\theader_up {} {{http.auth.user.name}}\n",
        NAME_HEADER
    ));
    out.push_str(&format!(
        "\t\theader_up {} {{http.auth.user.profile_picture}}\n",
        PROFILE_PIC_HEADER
    ));
    out.push_str(&format!(
        "\t\theader_up {} {}\n",
        TRUST_MARKER_HEADER, TRUST_MARKER_VALUE
    ));
    out.push_str("\t}\n");
    out.push_str("}\n");

    Ok(ConfigDocument {
        text: out,
        admin_address: config.admin_address.clone(),
    })
}
