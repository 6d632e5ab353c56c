//! Registered client types.
//!
//! Client registration itself lives outside this crate; these are the facts
//! the token core needs from a registration: whether the client is active,
//! what it may request, and which certificate it is bound to.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::mtls::CertificateInfo;

// =============================================================================
// Certificate Binding
// =============================================================================

/// A client's registered mTLS certificate.
///
/// Matching uses the thumbprint when present, otherwise the subject DN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBinding {
    /// Base64url SHA-256 thumbprint of the registered certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint_sha256: Option<String>,

    /// Base64url SHA-1 thumbprint (legacy registrations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint_sha1: Option<String>,

    /// Expected subject DN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_dn: Option<String>,

    /// Start of the binding's validity window.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub not_before: Option<OffsetDateTime>,

    /// End of the binding's validity window.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub not_after: Option<OffsetDateTime>,
}

impl CertificateBinding {
    /// Pins a binding to a parsed certificate.
    #[must_use]
    pub fn from_certificate(info: &CertificateInfo) -> Self {
        Self {
            thumbprint_sha256: Some(info.thumbprint_sha256.clone()),
            thumbprint_sha1: Some(info.thumbprint_sha1.clone()),
            subject_dn: Some(info.subject_dn.clone()),
            not_before: Some(info.not_before),
            not_after: Some(info.not_after),
        }
    }

    /// Binds by subject DN only.
    #[must_use]
    pub fn subject(dn: impl Into<String>) -> Self {
        Self {
            subject_dn: Some(dn.into()),
            ..Self::default()
        }
    }

    /// Returns `true` if `not_before <= now <= not_after`.
    ///
    /// Open ends are unbounded.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before.is_none_or(|nb| nb <= now) && self.not_after.is_none_or(|na| now <= na)
    }
}

// =============================================================================
// Registered Client
// =============================================================================

/// A client as seen by the token core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredClient {
    /// Unique client identifier used in OAuth flows.
    pub client_id: String,

    /// Whether this client may currently obtain tokens.
    pub active: bool,

    /// Scopes the client may request. Empty means any.
    #[serde(default)]
    pub allowed_scopes: Vec<String>,

    /// Audiences the client may request. Empty means any.
    #[serde(default)]
    pub allowed_audiences: Vec<String>,

    /// Registered mTLS certificate, if the client uses certificate binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_binding: Option<CertificateBinding>,
}

impl RegisteredClient {
    /// Creates an active client with no restrictions.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            active: true,
            allowed_scopes: Vec::new(),
            allowed_audiences: Vec::new(),
            certificate_binding: None,
        }
    }

    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_audiences<I, S>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_certificate_binding(mut self, binding: CertificateBinding) -> Self {
        self.certificate_binding = Some(binding);
        self
    }

    #[must_use]
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Checks if the given scope is allowed for this client.
    #[must_use]
    pub fn is_scope_allowed(&self, scope: &str) -> bool {
        self.allowed_scopes.is_empty() || self.allowed_scopes.iter().any(|s| s == scope)
    }

    /// Checks if the given audience is allowed for this client.
    #[must_use]
    pub fn is_audience_allowed(&self, audience: &str) -> bool {
        self.allowed_audiences.is_empty() || self.allowed_audiences.iter().any(|a| a == audience)
    }

    /// Returns `true` if tokens for this client must be certificate-bound.
    #[must_use]
    pub fn requires_certificate(&self) -> bool {
        self.certificate_binding.is_some()
    }
}
