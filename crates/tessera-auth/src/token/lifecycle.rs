//! Token lifecycle orchestration.
//!
//! Ties the JWT service, the certificate validator and the encrypted store
//! together. A token moves through `Issued -> Bound? -> Stored -> Active`
//! and ends `Expired` or `Revoked`. A token is only returned to the caller
//! once its record is stored, and a bound token stays bound for life.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::claims::{AccessTokenClaims, Audience, Confirmation};
use super::introspection::{InactiveReason, IntrospectionOutcome, IntrospectionResponse};
use super::jwt::{JwtService, TokenRequest};
use super::revocation::{RevocationReason, TokenTypeHint};
use super::validation::{TokenValidationError, ValidationOptions};
use crate::clock::{Clock, SystemClock};
use crate::config::TokenSecurityConfig;
use crate::crypto::EncryptionLevel;
use crate::mtls::{CertificateValidator, bind_token, match_client, verify_bound_token};
use crate::storage::{
    ClientRegistry, EncryptedTokenStore, RetrieveOutcome, StoredToken, TokenPayload, TokenType,
};
use crate::types::{RefreshToken, RegisteredClient, hash_token};
use crate::{AuthError, AuthResult};

// =============================================================================
// Requests and Results
// =============================================================================

/// Inputs for [`TokenLifecycleService::issue_access_token`].
#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    /// Subject (user or client ID).
    pub subject: String,
    /// Requesting client.
    pub client_id: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Requested audience.
    pub audience: Option<Audience>,
    /// Resource indicators.
    pub resource: Option<Vec<String>>,
    /// PEM or DER client certificate to bind the token to.
    pub binding_certificate: Option<Vec<u8>>,
    /// RFC 7638 thumbprint of a proof-of-possession key.
    pub jwk_thumbprint: Option<String>,
    /// Lifetime; falls back to the configured default.
    pub ttl: Option<Duration>,
    /// Caller-supplied claims.
    pub extra_claims: BTreeMap<String, Value>,
    /// End user the token was issued for, stored as record metadata.
    pub user_id: Option<String>,
    /// Overrides the configured encryption level for this record.
    pub encryption_level: Option<EncryptionLevel>,
}

impl IssueRequest {
    #[must_use]
    pub fn new(subject: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<Audience>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource: Vec<String>) -> Self {
        self.resource = Some(resource);
        self
    }

    #[must_use]
    pub fn with_certificate(mut self, certificate: impl Into<Vec<u8>>) -> Self {
        self.binding_certificate = Some(certificate.into());
        self
    }

    #[must_use]
    pub fn with_jwk_thumbprint(mut self, jkt: impl Into<String>) -> Self {
        self.jwk_thumbprint = Some(jkt.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_extra_claims(mut self, extra: BTreeMap<String, Value>) -> Self {
        self.extra_claims.extend(extra);
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_encryption_level(mut self, level: EncryptionLevel) -> Self {
        self.encryption_level = Some(level);
        self
    }
}

/// A freshly issued access token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The signed JWT.
    pub access_token: String,
    /// Claims embedded in the JWT.
    pub claims: AccessTokenClaims,
    /// Storage handle of the access token record.
    pub storage_id: String,
    /// Opaque refresh token, when refresh tokens are enabled.
    pub refresh_token: Option<String>,
}

impl IssuedToken {
    /// Seconds until the access token expires, relative to its `iat`.
    #[must_use]
    pub fn expires_in(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

// =============================================================================
// Lifecycle Service
// =============================================================================

/// Issues, introspects and revokes access tokens.
pub struct TokenLifecycleService {
    jwt: Arc<JwtService>,
    store: Arc<EncryptedTokenStore>,
    clients: Arc<dyn ClientRegistry>,
    certificates: CertificateValidator,
    clock: Arc<dyn Clock>,
    include_legacy_thumbprint: bool,
    refresh_token_lifetime: Option<Duration>,
}

impl TokenLifecycleService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        jwt: Arc<JwtService>,
        store: Arc<EncryptedTokenStore>,
        clients: Arc<dyn ClientRegistry>,
        config: &TokenSecurityConfig,
    ) -> Self {
        Self {
            jwt,
            store,
            clients,
            certificates: CertificateValidator::new(),
            clock: Arc::new(SystemClock),
            include_legacy_thumbprint: config.mtls.include_legacy_thumbprint,
            refresh_token_lifetime: config
                .token
                .issue_refresh_tokens
                .then_some(config.token.refresh_token_lifetime),
        }
    }

    /// Sets the clock used for certificate checks and refresh token expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.certificates = CertificateValidator::new().with_clock(clock.clone());
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<EncryptedTokenStore> {
        &self.store
    }

    #[must_use]
    pub fn jwt(&self) -> &Arc<JwtService> {
        &self.jwt
    }

    /// Issues an access token and stores its record.
    ///
    /// When a certificate is supplied it must match the client's registered
    /// binding and its thumbprint is embedded in `cnf`. A client with a
    /// registered binding must supply one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidClient`, `InvalidScope` or `InvalidRequest` for a
    /// request the client may not make, `BindingMismatch` for a certificate
    /// that does not match the registration, and any signing or storage
    /// error. No token is returned unless its record was stored.
    pub async fn issue_access_token(&self, request: IssueRequest) -> AuthResult<IssuedToken> {
        let client = self
            .clients
            .find_by_client_id(&request.client_id)
            .await?
            .ok_or_else(|| AuthError::invalid_client("unknown client"))?;
        authorize_request(&client, &request)?;

        let mut confirmation = self.certificate_confirmation(&client, &request)?;
        if let Some(jkt) = &request.jwk_thumbprint {
            confirmation
                .get_or_insert_with(Confirmation::default)
                .jkt = Some(jkt.clone());
        }

        let mut token_request = TokenRequest::new(request.subject, request.client_id)
            .with_scopes(request.scopes)
            .with_extra_claims(request.extra_claims);
        token_request.audience = request.audience;
        token_request.resource = request.resource;
        token_request.confirmation = confirmation;
        token_request.ttl = request.ttl;
        let (access_token, claims) = self.jwt.issue(token_request)?;

        let level = request
            .encryption_level
            .unwrap_or_else(|| self.store.default_level());
        let payload = TokenPayload::from_claims(&claims, request.user_id.clone())?;
        let storage_id = self.store.store(&payload, level).await?;

        let refresh_token = match self.refresh_token_lifetime {
            Some(lifetime) => Some(
                self.issue_refresh_token(&claims, request.user_id, &storage_id, lifetime, level)
                    .await?,
            ),
            None => None,
        };

        tracing::info!(
            client_id = %claims.client_id,
            jti = %claims.jti,
            storage_id = %storage_id,
            bound = claims.cnf.is_some(),
            "Issued access token"
        );
        Ok(IssuedToken {
            access_token,
            claims,
            storage_id,
            refresh_token,
        })
    }

    /// Reports whether a token is currently active.
    ///
    /// Never fails: every problem yields an inactive outcome whose
    /// `inactive_reason` says why. Tokens bound with `x5t#S256` are active
    /// only when `presented_certificate` matches the bound thumbprint.
    pub async fn introspect(
        &self,
        token: &str,
        presented_certificate: Option<&[u8]>,
    ) -> IntrospectionOutcome {
        let validation = self.jwt.validate(token, &ValidationOptions::new());
        if validation.has_error(&TokenValidationError::Expired)
            || validation.has_error(&TokenValidationError::NotYetValid)
        {
            return IntrospectionOutcome::inactive(InactiveReason::Expired);
        }
        let claims = match validation.into_result() {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Introspected token failed validation");
                return IntrospectionOutcome::inactive(InactiveReason::Invalid);
            }
        };

        let stored = match self.find_record(&claims.jti).await {
            Ok(stored) => stored,
            Err(reason) => {
                tracing::debug!(jti = %claims.jti, reason = %reason, "Introspected token has no usable record");
                return IntrospectionOutcome::inactive(reason);
            }
        };
        if stored.payload.token_type != TokenType::Access || stored.payload.token_id != claims.jti
        {
            return IntrospectionOutcome::inactive(InactiveReason::Invalid);
        }
        if stored.is_revoked() {
            return IntrospectionOutcome::inactive(InactiveReason::Revoked);
        }

        if let Some(cnf) = claims.cnf.as_ref().filter(|cnf| cnf.is_certificate_bound()) {
            let presented = presented_certificate
                .and_then(|bytes| self.certificates.parse(bytes).into_result().ok());
            if !verify_bound_token(cnf, presented.as_ref()) {
                tracing::warn!(
                    jti = %claims.jti,
                    client_id = %claims.client_id,
                    presented = presented.is_some(),
                    "Certificate-bound token presented without its certificate"
                );
                return IntrospectionOutcome::inactive(InactiveReason::BindingMismatch);
            }
        }

        IntrospectionOutcome::active(IntrospectionResponse::from_claims(&claims))
    }

    /// Revokes an access or refresh token on behalf of `requesting_client`.
    ///
    /// Revoking a refresh token also revokes the access token issued with
    /// it. Expired access tokens can still be revoked.
    ///
    /// # Returns
    ///
    /// `false` if the token is unknown or invalid.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the token belongs to another client,
    /// `IntegrityFailure` for a tampered record, and any storage error.
    pub async fn revoke(&self, token: &str, requesting_client: &str) -> AuthResult<bool> {
        match TokenTypeHint::infer(token) {
            TokenTypeHint::AccessToken => self.revoke_access_token(token, requesting_client).await,
            TokenTypeHint::RefreshToken => self.revoke_refresh_token(token, requesting_client).await,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn certificate_confirmation(
        &self,
        client: &RegisteredClient,
        request: &IssueRequest,
    ) -> AuthResult<Option<Confirmation>> {
        let Some(certificate) = &request.binding_certificate else {
            if client.requires_certificate() {
                return Err(AuthError::binding_mismatch(
                    "client requires a certificate-bound token",
                ));
            }
            return Ok(None);
        };

        let info = self.certificates.parse(certificate).into_result()?;
        if !match_client(&info, client, self.clock.now()) {
            tracing::warn!(
                client_id = %client.client_id,
                thumbprint = %info.thumbprint_sha256,
                "Presented certificate does not match client registration"
            );
            return Err(AuthError::binding_mismatch(
                "certificate does not match the client's registered binding",
            ));
        }
        Ok(Some(bind_token(&info, self.include_legacy_thumbprint)))
    }

    async fn issue_refresh_token(
        &self,
        claims: &AccessTokenClaims,
        user_id: Option<String>,
        access_storage_id: &str,
        lifetime: Duration,
        level: EncryptionLevel,
    ) -> AuthResult<String> {
        let refresh = RefreshToken::generate();
        let now = self.clock.now();
        let expires_at = time::Duration::try_from(lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add(lifetime))
            .ok_or_else(|| AuthError::configuration("refresh token lifetime out of range"))?;
        let mut payload = TokenPayload::opaque(
            TokenType::Refresh,
            refresh.hash(),
            &claims.client_id,
            &claims.sub,
            &claims.scope,
            now,
            expires_at,
        );
        payload.user_id = user_id;
        payload.audience = claims.aud.to_vec();

        let refresh_storage_id = self.store.store(&payload, level).await?;
        self.store
            .associate(&refresh_storage_id, access_storage_id)
            .await?;
        Ok(refresh.into_value())
    }

    /// Looks up and opens the record for a token id.
    async fn find_record(&self, token_id: &str) -> Result<StoredToken, InactiveReason> {
        let storage_id = match self.store.find_storage_id(token_id).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(InactiveReason::NotFound),
            Err(e) => {
                tracing::warn!(error = %e, "Token index lookup failed");
                return Err(InactiveReason::Unavailable);
            }
        };
        match self.store.retrieve(&storage_id).await {
            Ok(RetrieveOutcome::Found(stored)) => Ok(stored),
            Ok(RetrieveOutcome::NotFound) => Err(InactiveReason::NotFound),
            Ok(RetrieveOutcome::Expired) => Err(InactiveReason::Expired),
            Ok(RetrieveOutcome::IntegrityFailure) => Err(InactiveReason::IntegrityFailure),
            Err(e) if e.is_cryptographic() => Err(InactiveReason::IntegrityFailure),
            Err(e) => {
                tracing::warn!(storage_id = %storage_id, error = %e, "Token record read failed");
                Err(InactiveReason::Unavailable)
            }
        }
    }

    async fn revoke_access_token(&self, token: &str, requesting_client: &str) -> AuthResult<bool> {
        let validation = self.jwt.validate(token, &ValidationOptions::new());
        let only_time_errors = validation.errors.iter().all(|e| {
            matches!(
                e,
                TokenValidationError::Expired | TokenValidationError::NotYetValid
            )
        });
        let Some(claims) = validation.claims.filter(|_| only_time_errors) else {
            return Ok(false);
        };
        if claims.client_id != requesting_client {
            return Err(AuthError::forbidden("token was issued to another client"));
        }

        let Some(storage_id) = self.store.find_storage_id(&claims.jti).await? else {
            return Ok(false);
        };
        self.store
            .revoke(&storage_id, RevocationReason::ClientRequest)
            .await
    }

    async fn revoke_refresh_token(&self, token: &str, requesting_client: &str) -> AuthResult<bool> {
        let Some(storage_id) = self.store.find_storage_id(&hash_token(token)).await? else {
            return Ok(false);
        };
        let stored = match self.store.retrieve(&storage_id).await? {
            RetrieveOutcome::Found(stored) => stored,
            RetrieveOutcome::NotFound | RetrieveOutcome::Expired => return Ok(false),
            RetrieveOutcome::IntegrityFailure => return Err(AuthError::integrity(storage_id)),
        };
        if stored.payload.client_id != requesting_client {
            return Err(AuthError::forbidden("token was issued to another client"));
        }

        let revoked = self
            .store
            .revoke(&storage_id, RevocationReason::ClientRequest)
            .await?;
        if let Some(access_storage_id) = self.store.find_association(&storage_id).await? {
            self.store
                .revoke(&access_storage_id, RevocationReason::Cascade)
                .await?;
        }
        Ok(revoked)
    }
}

impl std::fmt::Debug for TokenLifecycleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleService")
            .field("jwt", &self.jwt)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Checks the request against the client's registration.
fn authorize_request(client: &RegisteredClient, request: &IssueRequest) -> AuthResult<()> {
    if !client.active {
        return Err(AuthError::invalid_client("client is inactive"));
    }
    if let Some(scope) = request.scopes.iter().find(|s| !client.is_scope_allowed(s)) {
        return Err(AuthError::invalid_scope(format!(
            "scope '{scope}' is not allowed for this client"
        )));
    }

    let audiences = request
        .audience
        .iter()
        .flat_map(Audience::to_vec)
        .chain(request.resource.iter().flatten().cloned());
    for audience in audiences {
        if !client.is_audience_allowed(&audience) {
            return Err(AuthError::invalid_request(format!(
                "audience '{audience}' is not allowed for this client"
            )));
        }
    }
    Ok(())
}
