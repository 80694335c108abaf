//! Bearer tokens for backend calls.

use crate::config::ServiceAccountKey;
use crate::{Error, Result};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::instrument;

/// Scopes requested for service-account access tokens.
pub const BACKEND_SCOPES: &str = "https://www.googleapis.com/auth/cloud-platform \
https://www.googleapis.com/auth/firebase \
https://www.googleapis.com/auth/identitytoolkit \
https://www.googleapis.com/auth/userinfo.email";

/// Refresh this many seconds before the access token expires.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Lifetime requested for the signed grant assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Supplies OAuth2 access tokens, refreshing them as needed.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token.
    async fn token(&self) -> Result<SecretString>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: SecretString,
}

impl StaticTokenSource {
    /// Source for a fixed token.
    pub fn new(token: impl Into<SecretString>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<SecretString> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
struct GrantAssertion<'a> {
    iss: &'a str,
    scope: &'static str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: SecretString,
    #[serde(default)]
    expires_in: i64,
}

struct CachedAccessToken {
    token: SecretString,
    expires_at: i64,
}

/// Exchanges a signed service-account assertion for access tokens
/// (OAuth2 JWT-bearer grant) and caches them until shortly before expiry.
pub struct ServiceAccountTokenSource {
    client_email: String,
    token_uri: String,
    key_id: Option<String>,
    key: EncodingKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedAccessToken>>,
}

impl std::fmt::Debug for ServiceAccountTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountTokenSource")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountTokenSource {
    /// Source for `key`.
    pub fn new(key: &ServiceAccountKey, http: reqwest::Client) -> Result<Self> {
        let pem = key.private_key.expose_secret();
        if pem.trim().is_empty() {
            return Err(Error::NoSigningKey);
        }
        Ok(Self {
            client_email: key.client_email.clone(),
            token_uri: key.token_uri.clone(),
            key_id: key.private_key_id.clone(),
            key: EncodingKey::from_rsa_pem(pem.as_bytes())?,
            http,
            cached: Mutex::new(None),
        })
    }

    async fn acquire(&self, now: i64) -> Result<CachedAccessToken> {
        let assertion = GrantAssertion {
            iss: &self.client_email,
            scope: BACKEND_SCOPES,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid.clone_from(&self.key_id);
        let assertion = jsonwebtoken::encode(&header, &assertion, &self.key)?;

        let resp = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(Error::Transport)?;
        if !status.is_success() {
            tracing::warn!(
                target: "identity.token_source",
                status = %status,
                "access token request rejected"
            );
            return Err(Error::BackendRejected {
                status: status.as_u16(),
                message: crate::dispatch::excerpt(&body),
            });
        }

        let parsed: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::IllegalType(format!("invalid token response: {e}")))?;
        let lifetime = if parsed.expires_in > 0 {
            parsed.expires_in
        } else {
            ASSERTION_LIFETIME_SECS
        };

        tracing::info!(
            target: "identity.token_source",
            expires_in = lifetime,
            "access token acquired"
        );
        Ok(CachedAccessToken {
            token: parsed.access_token,
            expires_at: now + lifetime,
        })
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    #[instrument(skip_all, fields(client_email = %self.client_email))]
    async fn token(&self) -> Result<SecretString> {
        let mut cached = self.cached.lock().await;
        let now = crate::now_epoch_secs();
        if let Some(current) = cached.as_ref() {
            if current.expires_at - REFRESH_MARGIN_SECS > now {
                return Ok(current.token.clone());
            }
        }
        let fresh = self.acquire(now).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

type SourceInit = Box<dyn Fn() -> Result<Arc<dyn TokenSource>> + Send + Sync>;

/// Builds its inner source on first use, exactly once.
///
/// Initialization runs under the cell's lock; a failed initialization is not
/// cached and is retried by the next caller.
pub struct LazyTokenSource {
    cell: OnceCell<Arc<dyn TokenSource>>,
    init: SourceInit,
}

impl std::fmt::Debug for LazyTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyTokenSource")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl LazyTokenSource {
    /// Source that calls `init` on first use.
    pub fn new(init: impl Fn() -> Result<Arc<dyn TokenSource>> + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceCell::new(),
            init: Box::new(init),
        }
    }

    /// True once the inner source exists.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

#[async_trait]
impl TokenSource for LazyTokenSource {
    async fn token(&self) -> Result<SecretString> {
        let source = self
            .cell
            .get_or_try_init(|| async {
                tracing::debug!(target: "identity.token_source", "initializing token source");
                (self.init)()
            })
            .await?;
        source.token().await
    }
}
