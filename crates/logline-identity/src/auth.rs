//! Per-app facade and the registry that hands it out.

use crate::accounts::{AccountsClient, UserRecord};
use crate::claims::Claims;
use crate::config::{App, DEFAULT_HTTP_TIMEOUT, DEFAULT_SERVICE_ACCOUNT_KEYS_URL, KeyEndpoints};
use crate::dispatch::RequestDispatcher;
use crate::keys::KeySetCache;
use crate::session::{DEFAULT_SESSION_DURATION, SessionCookieManager};
use crate::signer::TokenSigner;
use crate::token::Token;
use crate::token_source::{
    LazyTokenSource, ServiceAccountTokenSource, StaticTokenSource, TokenSource,
};
use crate::verifier::TokenVerifier;
use crate::{Error, Result};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Public-key caches shared by every app in a registry.
#[derive(Debug, Clone)]
pub struct KeySets {
    /// Keys that sign ID tokens.
    pub id_tokens: KeySetCache,
    /// Keys that sign session cookies.
    pub session_cookies: KeySetCache,
}

impl KeySets {
    /// Caches backed by the given JWKS endpoints.
    pub fn http(endpoints: &KeyEndpoints, http: &reqwest::Client) -> Self {
        Self {
            id_tokens: KeySetCache::http(endpoints.id_tokens.clone(), http.clone()),
            session_cookies: KeySetCache::http(endpoints.session_cookies.clone(), http.clone()),
        }
    }
}

/// Hands out one [`Auth`] per app name.
///
/// Owns the HTTP client and the key-set caches its instances share.
#[derive(Debug)]
pub struct AuthRegistry {
    instances: DashMap<String, Arc<Auth>>,
    key_sets: KeySets,
    signer_keys_url: String,
    http: reqwest::Client,
}

impl AuthRegistry {
    /// Registry fetching keys from `endpoints`.
    pub fn new(endpoints: &KeyEndpoints) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let key_sets = KeySets::http(endpoints, &http);
        Ok(Self::with_key_sets(key_sets, http)
            .with_signer_keys_url(endpoints.service_accounts.clone()))
    }

    /// Registry using caller-supplied key caches.
    pub fn with_key_sets(key_sets: KeySets, http: reqwest::Client) -> Self {
        Self {
            instances: DashMap::new(),
            key_sets,
            signer_keys_url: DEFAULT_SERVICE_ACCOUNT_KEYS_URL.to_string(),
            http,
        }
    }

    /// Prefix of the JWKS URL of a signing service account; the account's
    /// email is appended. Applies to instances created afterwards.
    pub fn with_signer_keys_url(mut self, prefix: impl Into<String>) -> Self {
        self.signer_keys_url = prefix.into();
        self
    }

    /// The instance for `app`, created on first request.
    ///
    /// Later calls with the same app name return the same instance, whatever
    /// options they carry.
    pub fn get(&self, app: &App) -> Arc<Auth> {
        match self.instances.entry(app.name().to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let auth = Arc::new(Auth::new(
                    app,
                    &self.key_sets,
                    &self.signer_keys_url,
                    &self.http,
                ));
                tracing::info!(target: "identity.auth", app = %app.name(), "auth instance created");
                Arc::clone(entry.insert(auth).value())
            }
        }
    }

    /// Number of instances created so far.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True before the first instance is created.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The key caches every instance verifies against.
    pub fn key_sets(&self) -> &KeySets {
        &self.key_sets
    }
}

/// Identity operations for one app.
#[derive(Debug)]
pub struct Auth {
    app_name: String,
    signer: Option<TokenSigner>,
    id_tokens: TokenVerifier,
    custom_tokens: Option<TokenVerifier>,
    accounts: AccountsClient,
    sessions: SessionCookieManager,
    tokens: Arc<LazyTokenSource>,
}

impl Auth {
    fn new(app: &App, key_sets: &KeySets, signer_keys_url: &str, http: &reqwest::Client) -> Self {
        let opts = app.options();
        let project_id = opts.project_id().unwrap_or_default().to_string();

        let signer = match &opts.service_account {
            Some(sa) => match TokenSigner::from_service_account(sa) {
                Ok(signer) => Some(signer),
                Err(e) => {
                    tracing::warn!(
                        target: "identity.auth",
                        app = %app.name(),
                        error = %e,
                        "service account cannot sign tokens"
                    );
                    None
                }
            },
            None => None,
        };
        let custom_tokens = signer.as_ref().map(|s| {
            let url = format!("{signer_keys_url}{}", s.client_email());
            TokenVerifier::custom_tokens(s.client_email(), KeySetCache::http(url, http.clone()))
        });

        let tokens = Arc::new(lazy_token_source(app, http.clone()));
        let dispatcher = RequestDispatcher::new(
            http.clone(),
            opts.identity_toolkit_url.clone(),
            tokens.clone() as Arc<dyn TokenSource>,
        )
        .with_timeout(opts.http_timeout);

        let accounts = AccountsClient::new(dispatcher.clone());
        let sessions = SessionCookieManager::new(
            dispatcher,
            TokenVerifier::session_cookies(project_id.clone(), key_sets.session_cookies.clone()),
            Arc::new(accounts.clone()),
        );

        Self {
            app_name: app.name().to_string(),
            signer,
            id_tokens: TokenVerifier::id_tokens(project_id, key_sets.id_tokens.clone()),
            custom_tokens,
            accounts,
            sessions,
            tokens,
        }
    }

    /// Name of the app this instance serves.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// True once a backend call has built the bearer-token source.
    pub fn token_source_initialized(&self) -> bool {
        self.tokens.is_initialized()
    }

    /// Mint a custom token for `uid`.
    pub fn create_custom_token(&self, uid: &str, claims: Option<&Claims>) -> Result<String> {
        self.signer
            .as_ref()
            .ok_or(Error::NoSigningKey)?
            .create_custom_token(uid, claims)
    }

    /// Verify an ID token.
    pub async fn verify_id_token(&self, id_token: &str) -> Result<Token> {
        self.id_tokens.verify(id_token).await
    }

    /// Verify an ID token, then make sure its account has not revoked it.
    ///
    /// The returned token carries the account's current custom claims.
    #[instrument(skip_all, fields(app = %self.app_name))]
    pub async fn verify_id_token_and_check_revoked(&self, id_token: &str) -> Result<Token> {
        let token = self.id_tokens.verify(id_token).await?;
        self.sessions.attach_account_claims(token).await
    }

    /// Verify a custom token minted with this app's service account.
    pub async fn verify_custom_token(&self, token: &str) -> Result<Token> {
        self.custom_tokens
            .as_ref()
            .ok_or(Error::NoSigningKey)?
            .verify(token)
            .await
    }

    /// Fetch the account with this uid.
    pub async fn get_user(&self, uid: &str) -> Result<UserRecord> {
        self.accounts.get_user(uid).await
    }

    /// Fetch the account with this email address.
    pub async fn get_user_by_email(&self, email: &str) -> Result<UserRecord> {
        self.accounts.get_user_by_email(email).await
    }

    /// Delete the account with this uid.
    pub async fn delete_user(&self, uid: &str) -> Result<()> {
        self.accounts.delete_user(uid).await
    }

    /// Invalidate every refresh token and session of `uid` issued before now.
    pub async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()> {
        self.accounts.revoke_refresh_tokens(uid).await
    }

    /// Exchange a verified ID token for a session cookie. `duration`
    /// defaults to five days.
    #[instrument(skip_all, fields(app = %self.app_name))]
    pub async fn create_session_cookie(
        &self,
        id_token: &str,
        duration: Option<Duration>,
    ) -> Result<String> {
        self.id_tokens.verify(id_token).await?;
        self.sessions
            .create_session_cookie(id_token, duration.unwrap_or(DEFAULT_SESSION_DURATION))
            .await
    }

    /// Verify a session cookie.
    pub async fn verify_session_cookie(&self, cookie: &str) -> Result<Token> {
        self.sessions.verify_session_cookie(cookie).await
    }

    /// True if `token` predates its account's revocation timestamp.
    pub async fn check_revoked(&self, token: &Token) -> Result<bool> {
        self.sessions.check_revoked(token).await
    }

    /// Verify a session cookie and return its account, unless the account
    /// revoked the cookie.
    pub async fn verify_session_cookie_and_check_revoked(
        &self,
        cookie: &str,
    ) -> Result<UserRecord> {
        self.sessions.verify_session_cookie_and_check_revoked(cookie).await
    }
}

/// Bearer tokens from the app's static access token, else its service
/// account. Built on first backend call.
fn lazy_token_source(app: &App, http: reqwest::Client) -> LazyTokenSource {
    let app_name = app.name().to_string();
    let access_token = app.options().access_token.clone();
    let service_account = app.options().service_account.clone();
    LazyTokenSource::new(move || {
        if let Some(token) = &access_token {
            return Ok(Arc::new(StaticTokenSource::new(token.clone())) as Arc<dyn TokenSource>);
        }
        match &service_account {
            Some(sa) => {
                let source = ServiceAccountTokenSource::new(sa, http.clone())?;
                Ok(Arc::new(source) as Arc<dyn TokenSource>)
            }
            None => Err(Error::Config(format!(
                "app {app_name} has no credential for backend calls"
            ))),
        }
    })
}
