//! logline-identity
//!
//! Server-side identity operations for apps backed by Firebase Authentication
//! (Identity Toolkit). It covers four recurring problems:
//!
//! - **Minting custom tokens** signed with a service-account key
//! - **Verifying ID tokens and session cookies** against rotating public keys,
//!   with a shared, single-flight key cache
//! - **Managing session cookies** and checking them for revocation
//! - **Looking up and managing accounts** through the backend
//!
//! Apps are identified by name. An [`AuthRegistry`] hands out one [`Auth`]
//! per app and owns the HTTP client and key caches they share.
//!
//! ## Quick start
//! ```no_run
//! use logline_identity::{App, AppOptions, AuthRegistry, KeyEndpoints};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = AuthRegistry::new(&KeyEndpoints::default())?;
//! let auth = registry.get(&App::default_app(AppOptions::from_env()?));
//!
//! let token = auth.verify_id_token("eyJ...").await?;
//! println!("uid={:?}", token.uid());
//!
//! let cookie = auth.create_session_cookie("eyJ...", None).await?;
//! let user = auth.verify_session_cookie_and_check_revoked(&cookie).await?;
//! println!("email={:?}", user.email);
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

mod accounts;
mod auth;
mod claims;
mod config;
mod cookie;
mod dispatch;
mod error;
mod keys;
mod session;
mod signer;
mod token;
mod token_source;
mod verifier;

#[cfg(test)]
mod testing;

pub use accounts::{AccountStore, AccountsClient, UserRecord};
pub use auth::{Auth, AuthRegistry, KeySets};
pub use claims::{Claims, MAX_CLAIMS_PAYLOAD_BYTES, RESERVED_CLAIMS, STANDARD_CLAIMS};
pub use config::{
    App, AppOptions, DEFAULT_APP_NAME, DEFAULT_HTTP_TIMEOUT, DEFAULT_ID_TOKEN_KEYS_URL,
    DEFAULT_IDENTITY_TOOLKIT_URL, DEFAULT_SERVICE_ACCOUNT_KEYS_URL, DEFAULT_SESSION_COOKIE_KEYS_URL,
    KeyEndpoints, ServiceAccountKey,
};
pub use cookie::{
    CookieOptions, DEFAULT_SESSION_COOKIE_NAME, SameSite, build_clear_cookie, build_session_cookie,
};
pub use dispatch::{RequestDispatcher, RequestSpec};
pub use error::{Error, Result};
pub use keys::{
    DEFAULT_MIN_REFETCH_INTERVAL, FetchedKeys, HttpKeySetFetcher, Jwk, JwkSet, KeySetCache,
    KeySetFetcher, PublicKey, StaticKeySetFetcher,
};
pub use session::{
    DEFAULT_SESSION_DURATION, MAX_SESSION_DURATION, MIN_SESSION_DURATION, SessionCookieManager,
    is_revoked,
};
pub use signer::{CUSTOM_TOKEN_AUDIENCE, MAX_UID_CHARS, TokenSigner, validate_uid};
pub use token::Token;
pub use token_source::{LazyTokenSource, ServiceAccountTokenSource, StaticTokenSource, TokenSource};
pub use verifier::{TokenVerifier, VerifyMode};

/// Seconds since the Unix epoch. Clamps to 0 if the clock is before it.
pub(crate) fn now_epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
