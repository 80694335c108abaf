//! Shared fixtures for unit tests.

use crate::config::ServiceAccountKey;
use crate::keys::{KeySetCache, StaticKeySetFetcher};
use crate::signer::TokenSigner;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

pub const PRIVATE_KEY: &str = include_str!("../tests/fixtures/rsa_private.pem");
pub const ROTATED_PRIVATE_KEY: &str = include_str!("../tests/fixtures/rsa_private_rotated.pem");
pub const JWKS: &str = include_str!("../tests/fixtures/jwks.json");

pub const KEY_ID: &str = "test-key-1";
pub const ROTATED_KEY_ID: &str = "test-key-2";
pub const PROJECT_ID: &str = "demo-project";
pub const CLIENT_EMAIL: &str = "svc@demo-project.iam.gserviceaccount.com";

pub fn service_account() -> ServiceAccountKey {
    ServiceAccountKey {
        project_id: PROJECT_ID.to_string(),
        private_key_id: Some(KEY_ID.to_string()),
        private_key: PRIVATE_KEY.into(),
        client_email: CLIENT_EMAIL.to_string(),
        token_uri: crate::config::DEFAULT_TOKEN_URI.to_string(),
    }
}

pub fn signer() -> TokenSigner {
    TokenSigner::from_service_account(&service_account()).unwrap()
}

pub fn static_keys(jwks: &str) -> KeySetCache {
    KeySetCache::new(StaticKeySetFetcher::from_json(jwks).unwrap())
}

/// RS256-sign an arbitrary payload.
pub fn sign(payload: &Value, kid: Option<&str>, pem: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_string);
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, payload, &key).unwrap()
}

/// Payload of an ID token or session cookie issued by `issuer_prefix`.
pub fn backend_payload(issuer_prefix: &str, uid: &str, iat: i64, exp: i64) -> Value {
    json!({
        "iss": format!("{issuer_prefix}{PROJECT_ID}"),
        "aud": PROJECT_ID,
        "iat": iat,
        "exp": exp,
        "auth_time": iat,
        "sub": uid,
        "user_id": uid,
        "email": "alice@example.com",
        "email_verified": true,
        "firebase": {"sign_in_provider": "password"},
    })
}
