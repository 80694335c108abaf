//! Session cookies: creation, verification, revocation checks.

use crate::accounts::{AccountStore, UserRecord};
use crate::dispatch::{RequestDispatcher, RequestSpec};
use crate::token::Token;
use crate::verifier::TokenVerifier;
use crate::{Error, Result};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Shortest accepted session lifetime.
pub const MIN_SESSION_DURATION: Duration = Duration::from_secs(5 * 60);

/// Longest accepted session lifetime.
pub const MAX_SESSION_DURATION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Lifetime used when the caller does not pick one.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(5 * 24 * 60 * 60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionCookieRequest {
    id_token: String,
    /// Seconds.
    valid_duration: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionCookieResponse {
    #[serde(default)]
    session_cookie: String,
}

pub(crate) static CREATE_SESSION_COOKIE: RequestSpec<
    CreateSessionCookieRequest,
    CreateSessionCookieResponse,
> = RequestSpec {
    method: Method::POST,
    endpoint: "createSessionCookie",
    validate_request: |req| {
        if req.id_token.is_empty() {
            return Err(Error::IllegalType("idToken must be non-empty".to_string()));
        }
        check_duration(Duration::from_secs(req.valid_duration))
    },
    validate_response: |resp| {
        if resp.session_cookie.is_empty() {
            Err(Error::IllegalType(
                "createSessionCookie response has no sessionCookie".to_string(),
            ))
        } else {
            Ok(())
        }
    },
};

fn check_duration(duration: Duration) -> Result<()> {
    if duration < MIN_SESSION_DURATION || duration > MAX_SESSION_DURATION {
        return Err(Error::InvalidSessionDuration(duration.as_secs()));
    }
    Ok(())
}

/// True if a credential issued at `issued_at_secs` predates the account's
/// `tokens_valid_after_millis`. A credential issued in the same millisecond
/// is still valid.
pub fn is_revoked(issued_at_secs: i64, tokens_valid_after_millis: i64) -> bool {
    issued_at_secs.saturating_mul(1000) < tokens_valid_after_millis
}

/// Creates and checks session cookies.
#[derive(Clone)]
pub struct SessionCookieManager {
    dispatcher: RequestDispatcher,
    verifier: TokenVerifier,
    accounts: Arc<dyn AccountStore>,
}

impl std::fmt::Debug for SessionCookieManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCookieManager")
            .field("dispatcher", &self.dispatcher)
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

impl SessionCookieManager {
    /// `verifier` must be in session-cookie mode.
    pub fn new(
        dispatcher: RequestDispatcher,
        verifier: TokenVerifier,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            dispatcher,
            verifier,
            accounts,
        }
    }

    /// Exchange an ID token for a session cookie valid for `duration`.
    ///
    /// The ID token itself is checked by the backend, not here.
    #[instrument(skip(self, id_token), fields(duration_secs = duration.as_secs()))]
    pub async fn create_session_cookie(
        &self,
        id_token: &str,
        duration: Duration,
    ) -> Result<String> {
        check_duration(duration)?;
        let req = CreateSessionCookieRequest {
            id_token: id_token.to_string(),
            valid_duration: duration.as_secs(),
        };
        let resp = self.dispatcher.call(&CREATE_SESSION_COOKIE, &req).await?;
        tracing::info!(target: "identity.session", "session cookie created");
        Ok(resp.session_cookie)
    }

    /// Verify a session cookie and decode it.
    pub async fn verify_session_cookie(&self, cookie: &str) -> Result<Token> {
        self.verifier.verify(cookie).await
    }

    /// True if the token's account revoked its credentials after the token
    /// was issued.
    #[instrument(skip_all)]
    pub async fn check_revoked(&self, token: &Token) -> Result<bool> {
        let uid = token.uid().ok_or(Error::MissingUid)?;
        let record = self.accounts.get_account(uid).await?;
        let revoked = is_revoked(token.issued_at(), record.tokens_valid_after_millis);
        if revoked {
            tracing::info!(target: "identity.session", "credential revoked");
        }
        Ok(revoked)
    }

    /// Verify a session cookie, then make sure its account has not revoked
    /// it, returning the account.
    ///
    /// # Errors
    ///
    /// Verification errors as for [`Self::verify_session_cookie`];
    /// [`Error::Revoked`] if the cookie predates the account's revocation.
    #[instrument(skip_all)]
    pub async fn verify_session_cookie_and_check_revoked(
        &self,
        cookie: &str,
    ) -> Result<UserRecord> {
        let token = self.verifier.verify(cookie).await?;
        self.current_account(&token).await
    }

    /// Check `token` against its account and attach the account's current
    /// custom claims to it.
    ///
    /// # Errors
    ///
    /// [`Error::Revoked`] if the token predates the account's revocation.
    #[instrument(skip_all)]
    pub async fn attach_account_claims(&self, token: Token) -> Result<Token> {
        let record = self.current_account(&token).await?;
        Ok(token.with_claims(record.custom_claims))
    }

    async fn current_account(&self, token: &Token) -> Result<UserRecord> {
        let uid = token.uid().ok_or(Error::UidExtractionFailed)?;
        let record = self.accounts.get_account(uid).await?;
        if is_revoked(token.issued_at(), record.tokens_valid_after_millis) {
            tracing::info!(target: "identity.session", "credential revoked");
            return Err(Error::Revoked);
        }
        Ok(record)
    }
}
