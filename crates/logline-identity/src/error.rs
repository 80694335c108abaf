//! Error types.

use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// Variants are grouped by the component that produces them. None of them
/// carry token, cookie, or key material.
#[derive(Debug, Error)]
pub enum Error {
    // Signer
    /// The user id is empty or longer than 128 characters.
    #[error("invalid uid: {0}")]
    InvalidUid(String),

    /// A developer claim uses a reserved claim name.
    #[error("developer claim {0:?} is reserved and cannot be specified")]
    ReservedClaim(String),

    /// Serialized developer claims exceed the backend payload limit.
    #[error("developer claims are {size} bytes, limit is {max}")]
    ClaimsTooLarge {
        /// Serialized size.
        size: usize,
        /// Allowed size.
        max: usize,
    },

    /// No service-account private key is configured.
    #[error("no signing key configured; a service account credential is required")]
    NoSigningKey,

    // Verifier and key cache
    /// The token is not a well-formed RS256 JWT.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The signature does not match the key advertised for the token's `kid`.
    #[error("token signature is invalid")]
    InvalidSignature,

    /// `iss` does not match the expected issuer.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    InvalidIssuer {
        /// Expected issuer.
        expected: String,
        /// Issuer found in the token.
        actual: String,
    },

    /// `aud` does not match the expected audience.
    #[error("audience mismatch: expected {expected}, got {actual}")]
    InvalidAudience {
        /// Expected audience.
        expected: String,
        /// Audience found in the token.
        actual: String,
    },

    /// `exp` is not in the future.
    #[error("token expired at {expired_at}")]
    TokenExpired {
        /// Expiry (epoch seconds).
        expired_at: i64,
    },

    /// `iat` is in the future beyond the allowed clock skew.
    #[error("token issued in the future ({issued_at})")]
    TokenNotYetValid {
        /// Issued-at (epoch seconds).
        issued_at: i64,
    },

    /// `sub` (or `uid`) is missing, empty, or too long.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// The current key set has no key with this id.
    #[error("no public key found for kid {0:?}")]
    KeyNotFound(String),

    /// Unable to fetch or parse the public key set.
    #[error("failed to fetch public keys: {0}")]
    KeyFetchFailed(String),

    // Dispatcher
    /// A request or response does not have the shape an operation expects.
    #[error("illegal request or response shape: {0}")]
    IllegalType(String),

    /// Neither a uid nor an email was supplied for an account operation.
    #[error("request has no uid or email to target")]
    MissingRequestTarget,

    /// The backend reports no matching account.
    #[error("user not found")]
    UserNotFound,

    /// The backend could not be reached.
    #[error("transport failure: {0}")]
    Transport(#[source] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("backend rejected request ({status}): {message}")]
    BackendRejected {
        /// HTTP status code.
        status: u16,
        /// Backend error code or body excerpt.
        message: String,
    },

    // Session-cookie manager
    /// The credential was issued before the account's revocation timestamp.
    #[error("token has been revoked")]
    Revoked,

    /// A revocation check was requested for a token without a uid.
    #[error("token has no uid")]
    MissingUid,

    /// A verified session cookie did not yield a uid.
    #[error("could not extract uid from verified token")]
    UidExtractionFailed,

    /// Session-cookie lifetime is outside the accepted range.
    #[error("session cookie duration of {0}s is outside the allowed range (300s to 1209600s)")]
    InvalidSessionDuration(u64),

    // Ambient
    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// jsonwebtoken error.
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl Error {
    /// True if the same call might succeed later without changing its input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::KeyFetchFailed(_) => true,
            Error::BackendRejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// True if the caller should obtain a fresh credential from the end-user.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Error::TokenExpired { .. } | Error::Revoked | Error::InvalidSignature
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(Error::KeyFetchFailed("timeout".into()).is_retryable());
        assert!(
            Error::BackendRejected {
                status: 503,
                message: "UNAVAILABLE".into()
            }
            .is_retryable()
        );
        assert!(
            !Error::BackendRejected {
                status: 400,
                message: "INVALID_ID_TOKEN".into()
            }
            .is_retryable()
        );
        assert!(!Error::MalformedToken("x".into()).is_retryable());
    }

    #[test]
    fn reauthentication_classification() {
        assert!(Error::Revoked.requires_reauthentication());
        assert!(Error::TokenExpired { expired_at: 1 }.requires_reauthentication());
        assert!(!Error::ReservedClaim("sub".into()).requires_reauthentication());
        assert!(!Error::UserNotFound.requires_reauthentication());
    }
}
