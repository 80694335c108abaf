//! Custom token minting.

use crate::claims::Claims;
use crate::config::{AppOptions, ServiceAccountKey};
use crate::{Error, Result};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::ExposeSecret;
use serde::Serialize;

/// Audience of every custom token.
pub const CUSTOM_TOKEN_AUDIENCE: &str =
    "https://identitytoolkit.googleapis.com/google.identity.identitytoolkit.v1.IdentityToolkit";

/// Lifetime of a custom token, in seconds.
pub const CUSTOM_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest accepted user id, in characters.
pub const MAX_UID_CHARS: usize = 128;

#[derive(Serialize)]
struct CustomTokenPayload<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'static str,
    iat: i64,
    exp: i64,
    uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<&'a Claims>,
}

/// Signs custom tokens with a service-account key.
#[derive(Clone)]
pub struct TokenSigner {
    client_email: String,
    key_id: Option<String>,
    key: EncodingKey,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("client_email", &self.client_email)
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl TokenSigner {
    /// Signer for a service account.
    ///
    /// Fails with [`Error::NoSigningKey`] if the key is empty and with
    /// [`Error::Jwt`] if it is not a PEM-encoded RSA key.
    pub fn from_service_account(sa: &ServiceAccountKey) -> Result<Self> {
        let pem = sa.private_key.expose_secret();
        if pem.trim().is_empty() || sa.client_email.is_empty() {
            return Err(Error::NoSigningKey);
        }
        Ok(Self {
            client_email: sa.client_email.clone(),
            key_id: sa.private_key_id.clone().filter(|k| !k.is_empty()),
            key: EncodingKey::from_rsa_pem(pem.as_bytes())?,
        })
    }

    /// Signer for an app's configured service account.
    pub fn from_options(opts: &AppOptions) -> Result<Self> {
        let sa = opts.service_account.as_ref().ok_or(Error::NoSigningKey)?;
        Self::from_service_account(sa)
    }

    /// Issuer and subject of every token this signer mints.
    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// `kid` header of minted tokens, if the key has an id.
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Mint a custom token for `uid`, valid for one hour.
    pub fn create_custom_token(&self, uid: &str, claims: Option<&Claims>) -> Result<String> {
        self.sign_at(uid, claims, crate::now_epoch_secs())
    }

    pub(crate) fn sign_at(&self, uid: &str, claims: Option<&Claims>, now: i64) -> Result<String> {
        validate_uid(uid)?;
        let claims = claims.filter(|c| !c.is_empty());
        if let Some(claims) = claims {
            claims.validate()?;
        }

        let payload = CustomTokenPayload {
            iss: &self.client_email,
            sub: &self.client_email,
            aud: CUSTOM_TOKEN_AUDIENCE,
            iat: now,
            exp: now + CUSTOM_TOKEN_LIFETIME_SECS,
            uid,
            claims,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid.clone_from(&self.key_id);

        let token = jsonwebtoken::encode(&header, &payload, &self.key)?;
        tracing::debug!(target: "identity.signer", "minted custom token");
        Ok(token)
    }
}

/// Check a user id is non-empty and at most [`MAX_UID_CHARS`] characters.
pub fn validate_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        return Err(Error::InvalidUid("uid must be non-empty".to_string()));
    }
    let len = uid.chars().count();
    if len > MAX_UID_CHARS {
        return Err(Error::InvalidUid(format!(
            "uid is {len} characters, limit is {MAX_UID_CHARS}"
        )));
    }
    Ok(())
}
