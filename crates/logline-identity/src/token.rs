//! Decoded identity tokens.

use crate::claims::Claims;

use serde::Serialize;

/// A verified ID token, session cookie, or custom token.
///
/// Only [`TokenVerifier`](crate::TokenVerifier) produces values of this type.
/// Standard fields have typed accessors; everything else the issuer put in
/// the payload is available through [`Token::claims`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    #[serde(rename = "iss")]
    issuer: String,
    #[serde(rename = "aud")]
    audience: String,
    #[serde(rename = "exp")]
    expires_at: i64,
    #[serde(rename = "iat")]
    issued_at: i64,
    #[serde(rename = "sub", skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<String>,
    #[serde(flatten)]
    claims: Claims,
}

impl Token {
    pub(crate) fn new(
        issuer: String,
        audience: String,
        expires_at: i64,
        issued_at: i64,
        subject: Option<String>,
        uid: Option<String>,
        claims: Claims,
    ) -> Self {
        Self {
            issuer,
            audience,
            expires_at,
            issued_at,
            subject,
            uid,
            claims,
        }
    }

    /// `iss`.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// `aud`.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// `exp`, epoch seconds.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// `iat`, epoch seconds.
    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    /// `sub`.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The user id this token belongs to.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref().filter(|uid| !uid.is_empty())
    }

    /// Custom and provider claims.
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Attach claims fetched from a secondary lookup.
    ///
    /// Standard claim names in `extra` are ignored; other keys overwrite.
    #[must_use]
    pub fn with_claims(mut self, extra: Claims) -> Self {
        self.claims.merge(extra);
        self
    }

    /// Time the end-user authenticated, epoch seconds; `0` when absent.
    pub fn auth_time(&self) -> i64 {
        self.claims.get_i64("auth_time").unwrap_or(0)
    }

    /// Display name; empty when absent.
    pub fn name(&self) -> &str {
        self.claims.get_str("name").unwrap_or_default()
    }

    /// Profile photo URL; empty when absent.
    pub fn picture(&self) -> &str {
        self.claims.get_str("picture").unwrap_or_default()
    }

    /// Email address; empty when absent.
    pub fn email(&self) -> &str {
        self.claims.get_str("email").unwrap_or_default()
    }

    /// Whether [`Token::email`] has been verified.
    pub fn is_email_verified(&self) -> bool {
        self.claims.get_bool("email_verified").unwrap_or(false)
    }
}
