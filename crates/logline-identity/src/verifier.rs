//! Token and session-cookie verification.

use crate::claims::Claims;
use crate::keys::KeySetCache;
use crate::signer::{CUSTOM_TOKEN_AUDIENCE, MAX_UID_CHARS};
use crate::token::Token;
use crate::{Error, Result};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::instrument;

/// Issuer prefix of ID tokens; the project id follows.
pub const ID_TOKEN_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// Issuer prefix of session cookies; the project id follows.
pub const SESSION_COOKIE_ISSUER_PREFIX: &str = "https://session.firebase.google.com/";

/// How far in the future `iat` may be.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// What kind of credential a [`TokenVerifier`] accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyMode {
    /// ID tokens issued to client apps.
    IdToken,
    /// Session cookies minted by the backend.
    SessionCookie,
    /// Custom tokens minted by [`TokenSigner`](crate::TokenSigner) for `signer_email`.
    CustomToken {
        /// Service-account email the token must be issued by.
        signer_email: String,
    },
}

impl VerifyMode {
    /// Expected `iss`.
    pub fn expected_issuer(&self, project_id: &str) -> String {
        match self {
            VerifyMode::IdToken => format!("{ID_TOKEN_ISSUER_PREFIX}{project_id}"),
            VerifyMode::SessionCookie => format!("{SESSION_COOKIE_ISSUER_PREFIX}{project_id}"),
            VerifyMode::CustomToken { signer_email } => signer_email.clone(),
        }
    }

    /// Expected `aud`.
    pub fn expected_audience(&self, project_id: &str) -> String {
        match self {
            VerifyMode::IdToken | VerifyMode::SessionCookie => project_id.to_string(),
            VerifyMode::CustomToken { .. } => CUSTOM_TOKEN_AUDIENCE.to_string(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            VerifyMode::IdToken => "id_token",
            VerifyMode::SessionCookie => "session_cookie",
            VerifyMode::CustomToken { .. } => "custom_token",
        }
    }
}

/// Verifies RS256 tokens against a [`KeySetCache`].
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    mode: VerifyMode,
    project_id: String,
    keys: KeySetCache,
    clock_skew: Duration,
}

impl TokenVerifier {
    /// Verifier for `mode`, scoped to `project_id`.
    pub fn new(mode: VerifyMode, project_id: impl Into<String>, keys: KeySetCache) -> Self {
        Self {
            mode,
            project_id: project_id.into(),
            keys,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    /// Verifier for ID tokens.
    pub fn id_tokens(project_id: impl Into<String>, keys: KeySetCache) -> Self {
        Self::new(VerifyMode::IdToken, project_id, keys)
    }

    /// Verifier for session cookies.
    pub fn session_cookies(project_id: impl Into<String>, keys: KeySetCache) -> Self {
        Self::new(VerifyMode::SessionCookie, project_id, keys)
    }

    /// Verifier for custom tokens minted by `signer_email`.
    pub fn custom_tokens(signer_email: impl Into<String>, keys: KeySetCache) -> Self {
        Self::new(
            VerifyMode::CustomToken {
                signer_email: signer_email.into(),
            },
            String::new(),
            keys,
        )
    }

    /// Override the tolerated `iat` skew.
    #[must_use]
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Accepted credential kind.
    pub fn mode(&self) -> &VerifyMode {
        &self.mode
    }

    /// Key cache used for signature checks.
    pub fn keys(&self) -> &KeySetCache {
        &self.keys
    }

    /// Verify `token` and decode it.
    ///
    /// # Errors
    ///
    /// Structural problems are reported as [`Error::MalformedToken`] before
    /// any key lookup. Key lookup fails with [`Error::KeyNotFound`] or
    /// [`Error::KeyFetchFailed`]; then come [`Error::InvalidSignature`],
    /// [`Error::InvalidIssuer`], [`Error::InvalidAudience`],
    /// [`Error::TokenExpired`], [`Error::TokenNotYetValid`] and
    /// [`Error::InvalidSubject`].
    #[instrument(skip_all, fields(mode = self.mode.label()))]
    pub async fn verify(&self, token: &str) -> Result<Token> {
        let result = self.verify_at(token, crate::now_epoch_secs()).await;
        if let Err(e) = &result {
            tracing::debug!(target: "identity.verify", error = %e, "verification failed");
        }
        result
    }

    pub(crate) async fn verify_at(&self, token: &str, now: i64) -> Result<Token> {
        let kid = parse_header(token)?;

        let needs_project = !matches!(self.mode, VerifyMode::CustomToken { .. });
        if needs_project && self.project_id.is_empty() {
            return Err(Error::Config(
                "a project id is required to verify tokens".to_string(),
            ));
        }

        let key = self.keys.get_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        let data =
            jsonwebtoken::decode::<Map<String, Value>>(token, key.decoding_key(), &validation)
                .map_err(|e| match e.kind() {
                    ErrorKind::InvalidSignature => Error::InvalidSignature,
                    ErrorKind::Json(_) | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => {
                        Error::MalformedToken(format!("undecodable payload: {e}"))
                    }
                    _ => Error::Jwt(e),
                })?;

        self.validate_claims(data.claims, now)
    }

    fn validate_claims(&self, mut payload: Map<String, Value>, now: i64) -> Result<Token> {
        let expected_issuer = self.mode.expected_issuer(&self.project_id);
        let issuer = take_str(&mut payload, "iss").unwrap_or_default();
        if issuer != expected_issuer {
            return Err(Error::InvalidIssuer {
                expected: expected_issuer,
                actual: issuer,
            });
        }

        let expected_audience = self.mode.expected_audience(&self.project_id);
        let audience = take_audience(&mut payload, &expected_audience);
        if audience != expected_audience {
            return Err(Error::InvalidAudience {
                expected: expected_audience,
                actual: audience,
            });
        }

        let expires_at = take_i64(&mut payload, "exp")
            .ok_or_else(|| Error::MalformedToken("missing exp".to_string()))?;
        let issued_at = take_i64(&mut payload, "iat")
            .ok_or_else(|| Error::MalformedToken("missing iat".to_string()))?;

        if expires_at <= now {
            return Err(Error::TokenExpired {
                expired_at: expires_at,
            });
        }
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if issued_at > now.saturating_add(skew) {
            return Err(Error::TokenNotYetValid { issued_at });
        }
        if expires_at <= issued_at {
            return Err(Error::MalformedToken("exp must be after iat".to_string()));
        }

        let subject = take_str(&mut payload, "sub");
        let subject = validate_user_id("sub", subject)?;
        let uid_claim = take_str(&mut payload, "uid");

        let (uid, claims) = match self.mode {
            VerifyMode::CustomToken { .. } => {
                let uid = validate_user_id("uid", uid_claim)?;
                let claims = match payload.remove("claims") {
                    Some(Value::Object(map)) => Claims::from(map),
                    Some(_) => {
                        return Err(Error::MalformedToken(
                            "claims must be an object".to_string(),
                        ));
                    }
                    None => Claims::new(),
                };
                (uid, claims)
            }
            VerifyMode::IdToken | VerifyMode::SessionCookie => {
                (subject.clone(), Claims::from(payload))
            }
        };

        Ok(Token::new(
            issuer,
            audience,
            expires_at,
            issued_at,
            Some(subject),
            Some(uid),
            claims,
        ))
    }
}

/// Check the token's shape and header; returns the `kid`.
fn parse_header(token: &str) -> Result<String> {
    if token.is_empty() {
        return Err(Error::MalformedToken("token is empty".to_string()));
    }
    if token.split('.').count() != 3 {
        return Err(Error::MalformedToken(
            "expected three dot-separated segments".to_string(),
        ));
    }

    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| Error::MalformedToken(format!("failed to decode header: {e}")))?;
    if header.alg != Algorithm::RS256 {
        return Err(Error::MalformedToken(format!(
            "unexpected algorithm {:?}, expected RS256",
            header.alg
        )));
    }
    header
        .kid
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| Error::MalformedToken("missing kid header".to_string()))
}

fn validate_user_id(claim: &str, value: Option<String>) -> Result<String> {
    let value = value.unwrap_or_default();
    if value.is_empty() {
        return Err(Error::InvalidSubject(format!("{claim} is missing or empty")));
    }
    if value.chars().count() > MAX_UID_CHARS {
        return Err(Error::InvalidSubject(format!(
            "{claim} is longer than {MAX_UID_CHARS} characters"
        )));
    }
    Ok(value)
}

fn take_str(payload: &mut Map<String, Value>, key: &str) -> Option<String> {
    match payload.remove(key)? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn take_i64(payload: &mut Map<String, Value>, key: &str) -> Option<i64> {
    let value = payload.remove(key)?;
    #[allow(clippy::cast_possible_truncation)]
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn take_audience(payload: &mut Map<String, Value>, expected: &str) -> String {
    match payload.remove("aud") {
        Some(Value::String(s)) => s,
        Some(Value::Array(values)) => {
            let values: Vec<&str> = values.iter().filter_map(Value::as_str).collect();
            if values.contains(&expected) {
                expected.to_string()
            } else {
                values.join(",")
            }
        }
        _ => String::new(),
    }
}
