//! Remote public key sets.
//!
//! [`KeySetCache`] serves verification keys by key id. A fresh set answers
//! directly; a miss fetches the whole set once, installs it wholesale, and
//! shares that fetch with every concurrent caller asking for the same key id.

use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Freshness used when the key endpoint sends no `max-age`.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

/// Shortest gap between fetches triggered by a key id missing from a fresh set.
pub const DEFAULT_MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

/// A JWKS (JSON Web Key Set).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JwkSet {
    /// Keys.
    pub keys: Vec<Jwk>,
}

/// RSA JSON Web Key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Jwk {
    /// Key type; only "RSA" is usable.
    pub kty: String,

    /// Key id.
    pub kid: Option<String>,

    /// Public key use.
    #[serde(rename = "use", default)]
    pub use_: Option<String>,

    /// Algorithm.
    #[serde(default)]
    pub alg: Option<String>,

    /// RSA modulus.
    #[serde(default)]
    pub n: Option<String>,

    /// RSA exponent.
    #[serde(default)]
    pub e: Option<String>,
}

/// A key set as returned by a [`KeySetFetcher`].
#[derive(Debug, Clone)]
pub struct FetchedKeys {
    /// Keys.
    pub keys: JwkSet,
    /// How long the set may be served before refetching.
    pub max_age: Duration,
}

/// Source of key sets.
#[async_trait]
pub trait KeySetFetcher: Send + Sync + 'static {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<FetchedKeys>;
}

/// Fetches a JWKS over HTTP, honoring `Cache-Control: max-age`.
#[derive(Debug, Clone)]
pub struct HttpKeySetFetcher {
    url: String,
    http: reqwest::Client,
}

impl HttpKeySetFetcher {
    /// Fetcher for `url` using a shared client.
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self) -> Result<FetchedKeys> {
        use reqwest::header;

        tracing::debug!(target: "identity.keys", url = %self.url, "fetching public keys");

        let resp = self.http.get(&self.url).send().await.map_err(|e| {
            tracing::error!(target: "identity.keys", error = %e, "public key fetch failed");
            Error::KeyFetchFailed(e.to_string())
        })?;

        if !resp.status().is_success() {
            tracing::error!(
                target: "identity.keys",
                status = %resp.status(),
                "key endpoint returned error"
            );
            return Err(Error::KeyFetchFailed(format!(
                "key endpoint returned {}",
                resp.status()
            )));
        }

        let max_age = resp
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_cache_control_max_age)
            .map_or(DEFAULT_MAX_AGE, Duration::from_secs);

        let text = resp
            .text()
            .await
            .map_err(|e| Error::KeyFetchFailed(e.to_string()))?;
        let keys: JwkSet = serde_json::from_str(&text)
            .map_err(|e| Error::KeyFetchFailed(format!("invalid key set: {e}")))?;

        Ok(FetchedKeys { keys, max_age })
    }
}

/// Serves a fixed key set.
#[derive(Debug, Clone)]
pub struct StaticKeySetFetcher {
    keys: JwkSet,
    max_age: Duration,
}

impl StaticKeySetFetcher {
    /// Fetcher that always returns `keys`.
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    /// Fetcher for a JWKS document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }
}

#[async_trait]
impl KeySetFetcher for StaticKeySetFetcher {
    async fn fetch(&self) -> Result<FetchedKeys> {
        Ok(FetchedKeys {
            keys: self.keys.clone(),
            max_age: self.max_age,
        })
    }
}

/// A verification key.
#[derive(Clone)]
pub struct PublicKey {
    kid: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl PublicKey {
    /// Key id.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Signing algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

struct KeySet {
    keys: HashMap<String, Arc<PublicKey>>,
    fetched_at: Instant,
    expires_at: Instant,
}

impl KeySet {
    fn build(fetched: FetchedKeys) -> Result<Self> {
        let mut keys = HashMap::new();
        for jwk in fetched.keys.keys {
            match decode_jwk(&jwk) {
                Ok(key) => {
                    keys.insert(key.kid.clone(), Arc::new(key));
                }
                Err(e) => {
                    tracing::warn!(
                        target: "identity.keys",
                        kid = ?jwk.kid,
                        error = %e,
                        "skipping unusable key"
                    );
                }
            }
        }
        if keys.is_empty() {
            return Err(Error::KeyFetchFailed(
                "key set contains no usable RS256 keys".to_string(),
            ));
        }
        let fetched_at = Instant::now();
        Ok(Self {
            keys,
            fetched_at,
            expires_at: fetched_at + fetched.max_age,
        })
    }

    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

fn decode_jwk(jwk: &Jwk) -> Result<PublicKey> {
    let kid = jwk
        .kid
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::KeyFetchFailed("JWK missing kid".to_string()))?;
    if jwk.kty != "RSA" {
        return Err(Error::KeyFetchFailed(format!("unsupported kty: {}", jwk.kty)));
    }
    if let Some(alg) = jwk.alg.as_deref() {
        if alg != "RS256" {
            return Err(Error::KeyFetchFailed(format!("unsupported alg: {alg}")));
        }
    }
    if jwk.use_.as_deref().is_some_and(|u| u != "sig") {
        return Err(Error::KeyFetchFailed("JWK is not a signing key".to_string()));
    }
    let n = jwk
        .n
        .as_deref()
        .ok_or_else(|| Error::KeyFetchFailed("RSA JWK missing n".to_string()))?;
    let e = jwk
        .e
        .as_deref()
        .ok_or_else(|| Error::KeyFetchFailed("RSA JWK missing e".to_string()))?;
    Ok(PublicKey {
        kid,
        algorithm: Algorithm::RS256,
        key: DecodingKey::from_rsa_components(n, e)?,
    })
}

type Flight = Shared<BoxFuture<'static, std::result::Result<Arc<KeySet>, String>>>;

struct Inner {
    fetcher: Arc<dyn KeySetFetcher>,
    current: RwLock<Option<Arc<KeySet>>>,
    in_flight: DashMap<String, Flight>,
    fetches: AtomicU64,
}

impl Inner {
    fn current(&self) -> Option<Arc<KeySet>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, set: Arc<KeySet>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(set);
    }

    /// True if the installed set is fresh and younger than `interval`.
    fn recently_fetched(&self, interval: Duration) -> bool {
        self.current()
            .is_some_and(|set| set.is_fresh() && set.fetched_at.elapsed() < interval)
    }

    fn fresh_key(&self, kid: &str) -> Option<Arc<PublicKey>> {
        let set = self.current()?;
        if !set.is_fresh() {
            return None;
        }
        set.keys.get(kid).cloned()
    }

    async fn refresh(inner: Arc<Inner>, kid: String) -> std::result::Result<Arc<KeySet>, String> {
        inner.fetches.fetch_add(1, Ordering::Relaxed);

        let outcome = match inner.fetcher.fetch().await.and_then(KeySet::build) {
            Ok(set) => {
                let set = Arc::new(set);
                inner.install(Arc::clone(&set));
                tracing::info!(
                    target: "identity.keys",
                    key_count = set.keys.len(),
                    "public key cache refreshed"
                );
                Ok(set)
            }
            Err(Error::KeyFetchFailed(msg)) => Err(msg),
            Err(e) => Err(e.to_string()),
        };

        inner.in_flight.remove(&kid);
        outcome
    }
}

/// Concurrency-safe cache of verification keys.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct KeySetCache {
    inner: Arc<Inner>,
    min_refetch_interval: Duration,
}

impl std::fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetCache")
            .field("fetches", &self.fetch_count())
            .field("in_flight", &self.inner.in_flight.len())
            .field("min_refetch_interval", &self.min_refetch_interval)
            .finish_non_exhaustive()
    }
}

impl KeySetCache {
    /// Cache backed by `fetcher`.
    pub fn new(fetcher: impl KeySetFetcher) -> Self {
        Self::from_arc(Arc::new(fetcher))
    }

    /// Cache backed by a shared fetcher.
    pub fn from_arc(fetcher: Arc<dyn KeySetFetcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                current: RwLock::new(None),
                in_flight: DashMap::new(),
                fetches: AtomicU64::new(0),
            }),
            min_refetch_interval: DEFAULT_MIN_REFETCH_INTERVAL,
        }
    }

    /// Minimum age of a fresh set before an unknown key id may trigger
    /// another fetch. Earlier misses fail with [`Error::KeyNotFound`].
    #[must_use]
    pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        self.min_refetch_interval = interval;
        self
    }

    /// Cache for a JWKS URL.
    pub fn http(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self::new(HttpKeySetFetcher::new(url, http))
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Get the key with id `kid`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] if a freshly fetched set lacks `kid`, or the
    /// installed set lacks it and is younger than the minimum refetch interval;
    /// [`Error::KeyFetchFailed`] if the set could not be fetched. A failed
    /// fetch leaves the previously installed set in place.
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn get_key(&self, kid: &str) -> Result<Arc<PublicKey>> {
        if let Some(key) = self.inner.fresh_key(kid) {
            tracing::debug!(target: "identity.keys", "public key cache hit");
            return Ok(key);
        }
        if self.inner.recently_fetched(self.min_refetch_interval) {
            tracing::debug!(target: "identity.keys", "unknown key id, refetch throttled");
            return Err(Error::KeyNotFound(kid.to_string()));
        }

        let flight = match self.inner.in_flight.entry(kid.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // a flight may have installed the key since the first check
                if let Some(key) = self.inner.fresh_key(kid) {
                    return Ok(key);
                }
                let flight = Inner::refresh(Arc::clone(&self.inner), kid.to_string())
                    .boxed()
                    .shared();
                entry.insert(flight.clone());
                flight
            }
        };

        let set = flight.await.map_err(Error::KeyFetchFailed)?;
        set.keys.get(kid).cloned().ok_or_else(|| {
            tracing::warn!(target: "identity.keys", "key id not present after refresh");
            Error::KeyNotFound(kid.to_string())
        })
    }
}

fn parse_cache_control_max_age(cc: &str) -> Option<u64> {
    for part in cc.split(',') {
        let p = part.trim();
        if p.eq_ignore_ascii_case("no-store") || p.eq_ignore_ascii_case("no-cache") {
            return Some(0);
        }
        if let Some(rest) = p.strip_prefix("max-age=") {
            if let Ok(n) = rest.trim().parse::<u64>() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::atomic::AtomicBool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Counts fetches, optionally slow, optionally failing.
    struct CountingFetcher {
        jwks: &'static str,
        max_age: Duration,
        delay: Duration,
        fail: AtomicBool,
    }

    impl CountingFetcher {
        fn new(jwks: &'static str) -> Self {
            Self {
                jwks,
                max_age: DEFAULT_MAX_AGE,
                delay: Duration::ZERO,
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl KeySetFetcher for Arc<CountingFetcher> {
        async fn fetch(&self) -> Result<FetchedKeys> {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::KeyFetchFailed("boom".to_string()));
            }
            Ok(FetchedKeys {
                keys: serde_json::from_str(self.jwks)?,
                max_age: self.max_age,
            })
        }
    }

    #[test]
    fn cache_control_parser() {
        assert_eq!(parse_cache_control_max_age("public, max-age=60"), Some(60));
        assert_eq!(parse_cache_control_max_age("max-age=0"), Some(0));
        assert_eq!(parse_cache_control_max_age("no-store"), Some(0));
        assert_eq!(parse_cache_control_max_age("public, must-revalidate"), None);
    }

    #[test]
    fn jwk_filtering() {
        let set: JwkSet = serde_json::from_str(testing::JWKS).unwrap();
        let mut jwk = set.keys.first().unwrap().clone();
        assert!(decode_jwk(&jwk).is_ok());

        jwk.alg = Some("RS512".into());
        assert!(decode_jwk(&jwk).is_err());

        jwk.alg = None;
        jwk.kty = "EC".into();
        assert!(decode_jwk(&jwk).is_err());

        jwk.kty = "RSA".into();
        jwk.kid = None;
        assert!(decode_jwk(&jwk).is_err());
    }

    #[tokio::test]
    async fn hit_after_first_fetch() {
        let fetcher = Arc::new(CountingFetcher::new(testing::JWKS));
        let cache = KeySetCache::new(Arc::clone(&fetcher));

        let key = cache.get_key(testing::KEY_ID).await.unwrap();
        assert_eq!(key.kid(), testing::KEY_ID);
        assert_eq!(key.algorithm(), Algorithm::RS256);
        cache.get_key(testing::KEY_ID).await.unwrap();

        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_is_key_not_found() {
        let cache = KeySetCache::new(Arc::new(CountingFetcher::new(testing::JWKS)));
        assert!(matches!(
            cache.get_key("forged").await,
            Err(Error::KeyNotFound(kid)) if kid == "forged"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kids_do_not_bypass_fresh_set() {
        let cache = KeySetCache::new(Arc::new(CountingFetcher::new(testing::JWKS)));
        cache.get_key(testing::KEY_ID).await.unwrap();

        for kid in ["forged-1", "forged-2", "forged-3"] {
            assert!(matches!(cache.get_key(kid).await, Err(Error::KeyNotFound(_))));
        }
        assert_eq!(cache.fetch_count(), 1);

        tokio::time::advance(DEFAULT_MIN_REFETCH_INTERVAL).await;
        assert!(matches!(
            cache.get_key("forged-4").await,
            Err(Error::KeyNotFound(_))
        ));
        assert_eq!(cache.fetch_count(), 2);
        assert!(cache.get_key(testing::KEY_ID).await.is_ok());
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn zero_interval_refetches_every_unknown_kid() {
        let cache = KeySetCache::new(Arc::new(CountingFetcher::new(testing::JWKS)))
            .with_min_refetch_interval(Duration::ZERO);
        cache.get_key(testing::KEY_ID).await.unwrap();
        assert!(cache.get_key("forged").await.is_err());
        assert!(cache.get_key("forged").await.is_err());
        assert_eq!(cache.fetch_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_fetch() {
        let fetcher = Arc::new(CountingFetcher {
            delay: Duration::from_millis(100),
            ..CountingFetcher::new(testing::JWKS)
        });
        let cache = KeySetCache::new(Arc::clone(&fetcher));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_key(testing::KEY_ID).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_set_is_refetched() {
        let fetcher = Arc::new(CountingFetcher {
            max_age: Duration::from_secs(60),
            ..CountingFetcher::new(testing::JWKS)
        });
        let cache = KeySetCache::new(Arc::clone(&fetcher));

        cache.get_key(testing::KEY_ID).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.get_key(testing::KEY_ID).await.unwrap();
        assert_eq!(cache.fetch_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.get_key(testing::KEY_ID).await.unwrap();
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_set() {
        let fetcher = Arc::new(CountingFetcher {
            max_age: Duration::from_secs(10),
            ..CountingFetcher::new(testing::JWKS)
        });
        let cache = KeySetCache::new(Arc::clone(&fetcher));
        cache.get_key(testing::KEY_ID).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        fetcher.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.get_key(testing::KEY_ID).await,
            Err(Error::KeyFetchFailed(msg)) if msg == "boom"
        ));
        assert!(cache.inner.current().is_some());

        fetcher.fail.store(false, Ordering::SeqCst);
        assert!(cache.get_key(testing::KEY_ID).await.is_ok());
        assert_eq!(cache.fetch_count(), 3);
    }

    #[tokio::test]
    async fn http_fetcher_reads_max_age() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "public, max-age=19000, must-revalidate")
                    .set_body_string(testing::JWKS),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher =
            HttpKeySetFetcher::new(format!("{}/jwks", server.uri()), reqwest::Client::new());
        let fetched = fetcher.fetch().await.unwrap();
        assert_eq!(fetched.max_age, Duration::from_secs(19_000));
        assert_eq!(fetched.keys.keys.len(), 1);
    }

    #[tokio::test]
    async fn http_fetcher_maps_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        for p in ["/jwks", "/garbage"] {
            let cache = KeySetCache::http(format!("{}{p}", server.uri()), http.clone());
            assert!(matches!(
                cache.get_key(testing::KEY_ID).await,
                Err(Error::KeyFetchFailed(_))
            ));
        }
    }
}
