//! Identity resolution from proxy-injected headers.
//!
//! The generated Caddyfile strips client-supplied copies of these headers
//! and sets them from the Tailscale auth placeholders, so by the time a
//! request reaches the application they can be trusted — provided the trust
//! marker is present. A request carrying login headers but no marker came in
//! around the proxy and resolves to no user.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Header carrying the caller's stable login identifier.
pub const LOGIN_HEADER: &str = "X-Webauth-User";
/// Header carrying the caller's human-readable display name.
pub const NAME_HEADER: &str = "X-Webauth-Name";
/// Header carrying the caller's profile picture URL, if any.
pub const PROFILE_PIC_HEADER: &str = "X-Webauth-Profile-Picture";
/// Marker header injected by the generated proxy config. Its absence means
/// the request did not pass through the proxy.
pub const TRUST_MARKER_HEADER: &str = "X-Caddytail-Proxied";
/// Value the proxy sets on the trust marker header.
pub const TRUST_MARKER_VALUE: &str = "true";

/// Prefix under which additional identity attributes are passed through.
const EXTRA_ATTRIBUTE_PREFIX: &str = "x-webauth-";

/// The header names that must hold for identity headers to be authentic.
///
/// Configured once at startup, read-only thereafter. The defaults are a
/// versioned wire contract with the generated Caddyfile; changing them is a
/// breaking change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustContext {
    /// Header that must be present for any identity to be trusted.
    pub trust_marker_header: String,
    /// Header carrying the login identifier (required).
    pub login_header: String,
    /// Header carrying the display name (optional, falls back to login).
    pub name_header: String,
    /// Header carrying the profile picture URL (optional).
    pub profile_pic_header: String,
}

impl Default for TrustContext {
    fn default() -> Self {
        Self {
            trust_marker_header: TRUST_MARKER_HEADER.to_string(),
            login_header: LOGIN_HEADER.to_string(),
            name_header: NAME_HEADER.to_string(),
            profile_pic_header: PROFILE_PIC_HEADER.to_string(),
        }
    }
}

/// Normalized caller identity for one request.
///
/// Created per inbound request; never persisted and never cached beyond the
/// request's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable login identifier, e.g. `alice@example.com`.
    pub login: String,
    /// Display name; falls back to the login when the proxy sent none.
    pub name: String,
    /// Profile picture URL, when present and well-formed.
    pub picture: Option<Url>,
    /// Additional `X-Webauth-*` attributes, passed through verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Resolves the current user from inbound request headers.
///
/// Purely a function of its input: no I/O, no mutable state, safe to call
/// concurrently from any number of request handlers.
#[derive(Debug, Clone, Default)]
pub struct IdentityExtractor {
    trust: TrustContext,
}

impl IdentityExtractor {
    /// Create an extractor with the default header contract.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an extractor with custom header names.
    pub fn with_trust_context(trust: TrustContext) -> Self {
        Self { trust }
    }

    /// Get the trust context in effect.
    pub fn trust_context(&self) -> &TrustContext {
        &self.trust
    }

    /// Resolve the current user from request headers.
    ///
    /// Returns `None` when the trust marker is absent or the login header is
    /// missing or empty. Malformed-but-present values degrade best-effort
    /// instead of failing: a missing display name falls back to the login
    /// and an unparseable picture URL becomes `None`.
    pub fn resolve(&self, headers: &HeaderMap) -> Option<UserRecord> {
        // Anti-spoofing: without the marker, login-like headers could have
        // been set by a client that bypassed the proxy.
        header_value(headers, &self.trust.trust_marker_header)?;

        let login = header_value(headers, &self.trust.login_header)?;

        let name = header_value(headers, &self.trust.name_header)
            .unwrap_or_else(|| login.clone());

        let picture = header_value(headers, &self.trust.profile_pic_header)
            .and_then(|raw| Url::parse(&raw).ok());

        let recognized = [
            self.trust.trust_marker_header.to_ascii_lowercase(),
            self.trust.login_header.to_ascii_lowercase(),
            self.trust.name_header.to_ascii_lowercase(),
            self.trust.profile_pic_header.to_ascii_lowercase(),
        ];
        let extra = headers
            .iter()
            .filter_map(|(key, value)| {
                let key = key.as_str().to_ascii_lowercase();
                if !key.starts_with(EXTRA_ATTRIBUTE_PREFIX) || recognized.contains(&key) {
                    return None;
                }
                let value = value.to_str().ok()?.trim();
                Some((key, value.to_string()))
            })
            .collect();

        Some(UserRecord {
            login,
            name,
            picture,
            extra,
        })
    }
}

/// Read a header as a trimmed, non-empty string.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRUST_MARKER_HEADER, TRUST_MARKER_VALUE.parse().unwrap());
        headers.insert(LOGIN_HEADER, "alice".parse().unwrap());
        headers.insert(NAME_HEADER, "Alice A.".parse().unwrap());
        headers
    }

    #[test]
    fn test_resolve_trusted_request() {
        let extractor = IdentityExtractor::new();
        let user = extractor.resolve(&trusted_headers()).unwrap();

        assert_eq!(user.login, "alice");
        assert_eq!(user.name, "Alice A.");
        assert!(user.picture.is_none());
        assert!(user.extra.is_empty());
    }

    #[test]
    fn test_resolve_rejects_missing_trust_marker() {
        let mut headers = trusted_headers();
        headers.remove(TRUST_MARKER_HEADER);

        // Login headers alone are forgeable by a client bypassing the proxy.
        assert!(IdentityExtractor::new().resolve(&headers).is_none());
    }

    #[test]
    fn test_resolve_rejects_missing_login() {
        let mut headers = trusted_headers();
        headers.remove(LOGIN_HEADER);
        assert!(IdentityExtractor::new().resolve(&headers).is_none());
    }

    #[test]
    fn test_resolve_rejects_empty_login() {
        let mut headers = trusted_headers();
        headers.insert(LOGIN_HEADER, "   ".parse().unwrap());
        assert!(IdentityExtractor::new().resolve(&headers).is_none());
    }

    #[test]
    fn test_missing_name_falls_back_to_login() {
        let mut headers = trusted_headers();
        headers.remove(NAME_HEADER);

        let user = IdentityExtractor::new().resolve(&headers).unwrap();
        assert_eq!(user.name, "alice");
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let mut headers = trusted_headers();
        headers.insert(LOGIN_HEADER, "  alice  ".parse().unwrap());

        let user = IdentityExtractor::new().resolve(&headers).unwrap();
        assert_eq!(user.login, "alice");
    }

    #[test]
    fn test_picture_parsed_when_well_formed() {
        let mut headers = trusted_headers();
        headers.insert(
            PROFILE_PIC_HEADER,
            "https://example.com/alice.png".parse().unwrap(),
        );

        let user = IdentityExtractor::new().resolve(&headers).unwrap();
        assert_eq!(
            user.picture.unwrap().as_str(),
            "https://example.com/alice.png"
        );
    }

    #[test]
    fn test_malformed_picture_degrades_to_none() {
        let mut headers = trusted_headers();
        headers.insert(PROFILE_PIC_HEADER, "not a url".parse().unwrap());

        // An authenticated request with a bad optional field is still a
        // legitimate caller.
        let user = IdentityExtractor::new().resolve(&headers).unwrap();
        assert!(user.picture.is_none());
    }

    #[test]
    fn test_extra_attributes_passed_through() {
        let mut headers = trusted_headers();
        headers.insert("X-Webauth-Tailnet", "example".parse().unwrap());
        headers.insert("X-Other-Header", "ignored".parse().unwrap());

        let user = IdentityExtractor::new().resolve(&headers).unwrap();
        assert_eq!(
            user.extra.get("x-webauth-tailnet").map(String::as_str),
            Some("example")
        );
        assert!(!user.extra.contains_key("x-other-header"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let extractor = IdentityExtractor::new();
        let headers = trusted_headers();
        assert_eq!(extractor.resolve(&headers), extractor.resolve(&headers));
    }

    #[test]
    fn test_custom_trust_context() {
        let extractor = IdentityExtractor::with_trust_context(TrustContext {
            trust_marker_header: "X-My-Proxy".to_string(),
            login_header: "X-My-User".to_string(),
            name_header: "X-My-Name".to_string(),
            profile_pic_header: "X-My-Pic".to_string(),
        });

        let mut headers = HeaderMap::new();
        headers.insert("X-My-Proxy", "1".parse().unwrap());
        headers.insert("X-My-User", "bob".parse().unwrap());

        let user = extractor.resolve(&headers).unwrap();
        assert_eq!(user.login, "bob");
        assert_eq!(user.name, "bob");

        // Default-contract headers mean nothing to this context.
        assert!(extractor.resolve(&trusted_headers()).is_none());
    }
}
