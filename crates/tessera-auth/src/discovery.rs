//! Authorization server metadata for the token security core.
//!
//! The subset of RFC 8414 metadata this crate is responsible for: signing
//! algorithms, introspection and revocation endpoints, and the RFC 8705
//! certificate-bound token members.
//!
//! # References
//!
//! - [RFC 8414 - OAuth 2.0 Authorization Server Metadata](https://tools.ietf.org/html/rfc8414)
//! - [RFC 8705 §5 - Metadata for mTLS](https://tools.ietf.org/html/rfc8705#section-5)

use serde::{Deserialize, Serialize};

use crate::config::TokenSecurityConfig;

/// Confirmation methods advertised in `cnf_methods_supported`.
pub const CNF_METHODS: &[&str] = &["x5t#S256", "jkt"];

/// Endpoints reachable over mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtlsEndpointAliases {
    pub token_endpoint: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
}

/// Read-only discovery document.
///
/// # Example Response
///
/// ```json
/// {
///   "issuer": "https://auth.example.com",
///   "introspection_endpoint": "https://auth.example.com/auth/introspect",
///   "revocation_endpoint": "https://auth.example.com/auth/revoke",
///   "token_endpoint_auth_signing_alg_values_supported": ["ES384", "RS256"],
///   "cnf_methods_supported": ["x5t#S256", "jkt"],
///   "tls_client_certificate_bound_access_tokens": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMetadata {
    pub issuer: String,

    pub introspection_endpoint: String,

    pub revocation_endpoint: String,

    /// Algorithms access tokens may be signed with.
    pub token_endpoint_auth_signing_alg_values_supported: Vec<String>,

    pub introspection_endpoint_auth_signing_alg_values_supported: Vec<String>,

    pub cnf_methods_supported: Vec<String>,

    pub tls_client_certificate_bound_access_tokens: bool,

    /// Present when a separate mTLS host is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtls_endpoint_aliases: Option<MtlsEndpointAliases>,
}

impl DiscoveryMetadata {
    /// Builds the document from configuration.
    ///
    /// Endpoint paths are relative to the issuer; mTLS aliases use
    /// `mtls.endpoint_base_url` when set.
    #[must_use]
    pub fn build(config: &TokenSecurityConfig) -> Self {
        let base = config.token.issuer.trim_end_matches('/');
        let algorithms = config.token.allowed_algorithms.clone();

        let mtls_endpoint_aliases = config.mtls.endpoint_base_url.as_deref().map(|mtls| {
            let mtls = mtls.trim_end_matches('/');
            MtlsEndpointAliases {
                token_endpoint: format!("{mtls}/auth/token"),
                introspection_endpoint: format!("{mtls}/auth/introspect"),
                revocation_endpoint: format!("{mtls}/auth/revoke"),
            }
        });

        Self {
            issuer: config.token.issuer.clone(),
            introspection_endpoint: format!("{base}/auth/introspect"),
            revocation_endpoint: format!("{base}/auth/revoke"),
            token_endpoint_auth_signing_alg_values_supported: algorithms.clone(),
            introspection_endpoint_auth_signing_alg_values_supported: algorithms,
            cnf_methods_supported: CNF_METHODS.iter().map(ToString::to_string).collect(),
            tls_client_certificate_bound_access_tokens: true,
            mtls_endpoint_aliases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_without_mtls_host() {
        let mut config = TokenSecurityConfig::default();
        config.token.issuer = "https://auth.example.com/".to_string();
        let metadata = DiscoveryMetadata::build(&config);

        assert_eq!(metadata.introspection_endpoint, "https://auth.example.com/auth/introspect");
        assert_eq!(metadata.revocation_endpoint, "https://auth.example.com/auth/revoke");
        assert_eq!(metadata.cnf_methods_supported, vec!["x5t#S256", "jkt"]);
        assert!(metadata.tls_client_certificate_bound_access_tokens);
        assert!(metadata.mtls_endpoint_aliases.is_none());

        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json.get("mtls_endpoint_aliases").is_none());
        assert_eq!(
            json["token_endpoint_auth_signing_alg_values_supported"],
            serde_json::json!(["ES384", "RS256", "RS384"])
        );
    }

    #[test]
    fn test_build_with_mtls_aliases() {
        let mut config = TokenSecurityConfig::default();
        config.mtls.endpoint_base_url = Some("https://mtls.auth.example.com".to_string());
        let metadata = DiscoveryMetadata::build(&config);

        let aliases = metadata.mtls_endpoint_aliases.unwrap();
        assert_eq!(aliases.token_endpoint, "https://mtls.auth.example.com/auth/token");
        assert_eq!(
            aliases.introspection_endpoint,
            "https://mtls.auth.example.com/auth/introspect"
        );
        assert_eq!(aliases.revocation_endpoint, "https://mtls.auth.example.com/auth/revoke");
    }
}
