// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pkcs8::{DecodePrivateKey, EncodePublicKey};
use reqwest::{RequestBuilder, StatusCode};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_TOKEN_REFRESH_MARGIN, JWT_BEARER_GRANT, JWT_LIFETIME, OAUTH_TOKEN_PATH,
    TOKEN_REFRESH_ATTEMPTS, TOKEN_REFRESH_RETRY_DELAY,
};
use crate::errors::AuthError;

/// Bearer token for the ingestion service.
#[derive(Clone)]
pub struct Credential {
    token: String,
    principal: String,
    /// `None` for tokens that do not expire (programmatic access tokens).
    expires_at: Option<Instant>,
}

impl Credential {
    pub fn new(token: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            principal: principal.into(),
            expires_at: None,
        }
    }

    pub fn expiring_in(mut self, lifetime: Duration) -> Self {
        self.expires_at = Some(Instant::now() + lifetime);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// True while more than `margin` of lifetime remains.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at.saturating_duration_since(Instant::now()) > margin,
        }
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Produces fresh credentials on demand.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, AuthError>;
}

/// Programmatic access token used verbatim as the bearer credential.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
    principal: String,
}

impl StaticToken {
    pub fn new(token: &str, principal: &str) -> Self {
        Self {
            token: token.to_string(),
            principal: principal.to_string(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticToken {
    async fn fetch(&self) -> Result<Credential, AuthError> {
        if self.token.trim().is_empty() {
            return Err(AuthError::InvalidMaterial(
                "programmatic access token is empty".to_string(),
            ));
        }
        Ok(Credential::new(self.token.clone(), self.principal.clone()))
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Exchanges a long-lived OAuth refresh token for short-lived access tokens.
pub struct OAuthRefreshSource {
    client: reqwest::Client,
    token_url: String,
    refresh_token: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    scope: String,
    principal: String,
}

impl OAuthRefreshSource {
    pub fn new(
        client: reqwest::Client,
        account_url: &str,
        refresh_token: &str,
        scope: &str,
        principal: &str,
    ) -> Self {
        Self {
            client,
            token_url: format!("{}{}", account_url.trim_end_matches('/'), OAUTH_TOKEN_PATH),
            refresh_token: refresh_token.to_string(),
            client_id: None,
            client_secret: None,
            scope: scope.to_string(),
            principal: principal.to_string(),
        }
    }

    pub fn with_client_credentials(mut self, client_id: &str, client_secret: Option<&str>) -> Self {
        self.client_id = Some(client_id.to_string());
        self.client_secret = client_secret.map(str::to_string);
        self
    }
}

#[async_trait]
impl CredentialSource for OAuthRefreshSource {
    async fn fetch(&self) -> Result<Credential, AuthError> {
        if self.refresh_token.trim().is_empty() {
            return Err(AuthError::InvalidMaterial(
                "OAuth refresh token is empty".to_string(),
            ));
        }
        debug!("AUTH | Requesting access token from {}", self.token_url);

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let mut request = self.client.post(&self.token_url).form(&form);
        if let Some(client_id) = &self.client_id {
            request = request.basic_auth(client_id, self.client_secret.as_deref());
        }

        request_access_token(request, &self.principal, None).await
    }
}

/// Sends a token request and maps the response to a credential. `fallback_lifetime` is
/// used when the endpoint does not report `expires_in`.
async fn request_access_token(
    request: RequestBuilder,
    principal: &str,
    fallback_lifetime: Option<Duration>,
) -> Result<Credential, AuthError> {
    let response = request
        .send()
        .await
        .map_err(|e| AuthError::Transport(e.to_string()))?;
    let status = response.status();
    if status == StatusCode::BAD_REQUEST
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        let message = response.text().await.unwrap_or_default();
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    if !status.is_success() {
        return Err(AuthError::Transport(format!(
            "token endpoint returned status {status}"
        )));
    }

    let body: OAuthTokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::Transport(format!("malformed token response: {e}")))?;
    let token = body
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::Rejected {
            status: status.as_u16(),
            message: "no access_token in response".to_string(),
        })?;

    let credential = Credential::new(token, principal);
    Ok(
        match body.expires_in.map(Duration::from_secs).or(fallback_lifetime) {
            Some(lifetime) => credential.expiring_in(lifetime),
            None => credential,
        },
    )
}

#[derive(Serialize)]
struct KeyPairClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

/// Signs short-lived RS256 assertions with an RSA private key and exchanges them for
/// access tokens using the JWT bearer grant.
///
/// The issuer is `{ACCOUNT}.{USER}.SHA256:{fingerprint}`, where the fingerprint is the
/// SHA-256 of the DER-encoded public key.
pub struct JwtKeyPairSource {
    client: reqwest::Client,
    token_url: String,
    qualified_user: String,
    fingerprint: String,
    signing_key: EncodingKey,
    scope: String,
}

impl JwtKeyPairSource {
    /// Loads a PKCS#8 (optionally encrypted) or PKCS#1 PEM private key.
    pub fn from_pem(
        client: reqwest::Client,
        account_url: &str,
        account: &str,
        user: &str,
        pem: &str,
        passphrase: Option<&str>,
        scope: &str,
    ) -> Result<Self, AuthError> {
        let key = decode_private_key(pem, passphrase)?;
        let fingerprint = public_key_fingerprint(&key)?;
        let der = key
            .to_pkcs1_der()
            .map_err(|e| AuthError::InvalidMaterial(format!("cannot encode private key: {e}")))?;
        let qualified_user = qualified_user(account, user);
        info!("AUTH | Using key pair authentication for {qualified_user} ({fingerprint})");

        Ok(Self {
            client,
            token_url: format!("{}{}", account_url.trim_end_matches('/'), OAUTH_TOKEN_PATH),
            qualified_user,
            fingerprint,
            signing_key: EncodingKey::from_rsa_der(der.as_bytes()),
            scope: scope.to_string(),
        })
    }

    pub fn from_pem_file(
        client: reqwest::Client,
        account_url: &str,
        account: &str,
        user: &str,
        path: &Path,
        passphrase: Option<&str>,
        scope: &str,
    ) -> Result<Self, AuthError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            AuthError::InvalidMaterial(format!(
                "cannot read private key {}: {e}",
                path.display()
            ))
        })?;
        Self::from_pem(client, account_url, account, user, &pem, passphrase, scope)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn issuer(&self) -> String {
        format!("{}.{}", self.qualified_user, self.fingerprint)
    }

    fn sign(&self) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = KeyPairClaims {
            iss: self.issuer(),
            sub: self.qualified_user.clone(),
            iat,
            exp: iat + JWT_LIFETIME.as_secs() as i64,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| AuthError::InvalidMaterial(format!("cannot sign assertion: {e}")))
    }
}

#[async_trait]
impl CredentialSource for JwtKeyPairSource {
    async fn fetch(&self) -> Result<Credential, AuthError> {
        let assertion = self.sign()?;
        debug!("AUTH | Exchanging key pair assertion at {}", self.token_url);

        let form = [
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let request = self.client.post(&self.token_url).form(&form);
        request_access_token(request, &self.qualified_user, Some(JWT_LIFETIME)).await
    }
}

fn decode_private_key(pem: &str, passphrase: Option<&str>) -> Result<RsaPrivateKey, AuthError> {
    let decoded = match passphrase {
        Some(passphrase) => RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
            .map_err(|e| e.to_string()),
        None if pem.contains("BEGIN RSA PRIVATE KEY") => {
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| e.to_string())
        }
        None => RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| e.to_string()),
    };
    decoded.map_err(|e| AuthError::InvalidMaterial(format!("cannot load private key: {e}")))
}

fn public_key_fingerprint(key: &RsaPrivateKey) -> Result<String, AuthError> {
    let der = RsaPublicKey::from(key)
        .to_public_key_der()
        .map_err(|e| AuthError::InvalidMaterial(format!("cannot encode public key: {e}")))?;
    Ok(format!(
        "SHA256:{}",
        hex::encode_upper(Sha256::digest(der.as_bytes()))
    ))
}

// The account part drops any region or cloud suffix ("xy12345.us-east-1").
fn qualified_user(account: &str, user: &str) -> String {
    let account = account.split('.').next().unwrap_or(account);
    format!("{}.{}", account.to_uppercase(), user.to_uppercase())
}

/// Hands out a cached credential, refreshing it shortly before it expires.
///
/// The cache lock is held across a refresh, so concurrent callers wait for the single
/// in-flight refresh instead of issuing their own.
pub struct TokenProvider {
    source: Arc<dyn CredentialSource>,
    cached: Mutex<Option<Credential>>,
    refresh_margin: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

impl TokenProvider {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            refresh_margin: DEFAULT_TOKEN_REFRESH_MARGIN,
            max_attempts: TOKEN_REFRESH_ATTEMPTS,
            retry_delay: TOKEN_REFRESH_RETRY_DELAY,
        }
    }

    pub fn new_from_static_token(token: &str, principal: &str) -> Self {
        Self::new(Arc::new(StaticToken::new(token, principal)))
    }

    #[must_use]
    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub async fn get_credential(&self) -> Result<Credential, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if credential.is_fresh(self.refresh_margin) {
                return Ok(credential.clone());
            }
            debug!("AUTH | Cached credential is within the refresh margin, refreshing");
        }

        let credential = self.refresh().await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drops the cached credential so the next call refreshes it.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    async fn refresh(&self) -> Result<Credential, AuthError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.source.fetch().await {
                Ok(credential) => {
                    info!(
                        "AUTH | Obtained credential for principal {}",
                        credential.principal()
                    );
                    return Ok(credential);
                }
                Err(e) if e.is_retryable() && attempts < self.max_attempts => {
                    warn!("AUTH | Credential refresh attempt {attempts} failed: {e}");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(AuthError::Exhausted {
                        attempts,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenProvider")
    }
}
