//! Developer-supplied claims.

use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Claim names that belong to the token itself and never appear among
/// custom claims of a decoded [`Token`](crate::Token).
pub const STANDARD_CLAIMS: [&str; 6] = ["iss", "aud", "exp", "iat", "sub", "uid"];

/// Claim names the backend reserves. Developer claims may not use them.
pub const RESERVED_CLAIMS: [&str; 16] = [
    "acr", "amr", "at_hash", "aud", "auth_time", "azp", "cnf", "c_hash", "exp", "firebase",
    "iat", "iss", "jti", "nbf", "nonce", "sub",
];

/// Maximum serialized size of developer claims, in bytes.
pub const MAX_CLAIMS_PAYLOAD_BYTES: usize = 1000;

/// A JSON object of claims with typed accessors.
///
/// Accessors return `None` for absent keys and for values of the wrong type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Empty claim set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a claim, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a claim, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Boolean value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Integer value.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Floating point value.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// True if the claim is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Remove a claim.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Number of claims.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no claims.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over claims.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Copy every entry of `other` into `self`, skipping standard claim names.
    pub(crate) fn merge(&mut self, other: Claims) {
        for (key, value) in other.0 {
            if !STANDARD_CLAIMS.contains(&key.as_str()) {
                self.0.insert(key, value);
            }
        }
    }

    /// Check the claims can be embedded in a custom token.
    ///
    /// Fails with [`Error::ReservedClaim`] on the first reserved name and with
    /// [`Error::ClaimsTooLarge`] when the JSON form exceeds
    /// [`MAX_CLAIMS_PAYLOAD_BYTES`].
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = self.0.keys().find(|k| is_reserved(k)) {
            return Err(Error::ReservedClaim(key.clone()));
        }

        let size = serde_json::to_vec(&self.0)?.len();
        if size > MAX_CLAIMS_PAYLOAD_BYTES {
            return Err(Error::ClaimsTooLarge {
                size,
                max: MAX_CLAIMS_PAYLOAD_BYTES,
            });
        }
        Ok(())
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Claims> for Value {
    fn from(claims: Claims) -> Self {
        Value::Object(claims.0)
    }
}

impl TryFrom<Value> for Claims {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::IllegalType(format!(
                "claims must be a JSON object, got {other}"
            ))),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Claims {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn is_reserved(key: &str) -> bool {
    RESERVED_CLAIMS.contains(&key) || STANDARD_CLAIMS.contains(&key)
}
