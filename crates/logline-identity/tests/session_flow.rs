//! End-to-end flows against a mocked identity backend.

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use logline_identity::{
    App, AppOptions, AuthRegistry, Claims, DEFAULT_MIN_REFETCH_INTERVAL, Error, KeySetCache,
    KeySets, ServiceAccountKey,
};
use serde_json::{Value, json};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRIVATE_KEY: &str = include_str!("fixtures/rsa_private.pem");
const ROTATED_PRIVATE_KEY: &str = include_str!("fixtures/rsa_private_rotated.pem");
const JWKS: &str = include_str!("fixtures/jwks.json");
const ROTATED_JWKS: &str = include_str!("fixtures/jwks_rotated.json");

const PROJECT_ID: &str = "demo-project";
const CLIENT_EMAIL: &str = "svc@demo-project.iam.gserviceaccount.com";

fn now() -> i64 {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    i64::try_from(elapsed.as_secs()).unwrap()
}

fn sign(payload: &Value, kid: &str, pem: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, payload, &key).unwrap()
}

fn credential(issuer_prefix: &str, uid: &str, iat: i64) -> Value {
    json!({
        "iss": format!("{issuer_prefix}{PROJECT_ID}"),
        "aud": PROJECT_ID,
        "iat": iat,
        "exp": iat + 3600,
        "auth_time": iat,
        "sub": uid,
        "user_id": uid,
        "email": "alice@example.com",
        "email_verified": true,
        "firebase": {"sign_in_provider": "password"},
    })
}

fn id_token(uid: &str, iat: i64) -> String {
    sign(
        &credential("https://securetoken.google.com/", uid, iat),
        "test-key-1",
        PRIVATE_KEY,
    )
}

fn session_cookie(uid: &str, iat: i64) -> String {
    sign(
        &credential("https://session.firebase.google.com/", uid, iat),
        "test-key-1",
        PRIVATE_KEY,
    )
}

fn service_account() -> ServiceAccountKey {
    ServiceAccountKey::from_json(
        &json!({
            "type": "service_account",
            "project_id": PROJECT_ID,
            "private_key_id": "test-key-1",
            "private_key": PRIVATE_KEY,
            "client_email": CLIENT_EMAIL,
        })
        .to_string(),
    )
    .unwrap()
}

/// Registry whose keys and backend all live on `server`.
fn registry(server: &MockServer) -> AuthRegistry {
    registry_with_refetch_interval(server, DEFAULT_MIN_REFETCH_INTERVAL)
}

fn registry_with_refetch_interval(server: &MockServer, interval: Duration) -> AuthRegistry {
    let http = reqwest::Client::new();
    let key_sets = KeySets {
        id_tokens: KeySetCache::http(format!("{}/idTokenKeys", server.uri()), http.clone())
            .with_min_refetch_interval(interval),
        session_cookies: KeySetCache::http(
            format!("{}/sessionCookiePublicKeys", server.uri()),
            http.clone(),
        ),
    };
    AuthRegistry::with_key_sets(key_sets, http)
        .with_signer_keys_url(format!("{}/jwk/", server.uri()))
}

fn app(server: &MockServer) -> App {
    let mut opts = AppOptions::with_service_account(service_account());
    opts.access_token = Some("owner-token".into());
    opts.identity_toolkit_url = format!("{}/relyingparty", server.uri());
    App::default_app(opts)
}

async fn serve_keys(server: &MockServer, route: &str, jwks: &str) {
    Mock::given(method("GET"))
        .and(path(route.to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "public, max-age=3600")
                .set_body_string(jwks.to_string()),
        )
        .mount(server)
        .await;
}

async fn serve_account(server: &MockServer, valid_since_secs: i64) {
    Mock::given(method("POST"))
        .and(path("/relyingparty/getAccountInfo"))
        .and(header("authorization", "Bearer owner-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "identitytoolkit#GetAccountInfoResponse",
            "users": [{
                "localId": "alice",
                "email": "alice@example.com",
                "emailVerified": true,
                "validSince": valid_since_secs.to_string(),
            }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn session_cookie_lifecycle() {
    let server = MockServer::start().await;
    serve_keys(&server, "/idTokenKeys", JWKS).await;
    serve_keys(&server, "/sessionCookiePublicKeys", JWKS).await;
    serve_account(&server, 0).await;

    let issued = now() - 30;
    let token = id_token("alice", issued);
    let cookie = session_cookie("alice", issued);

    Mock::given(method("POST"))
        .and(path("/relyingparty/createSessionCookie"))
        .and(body_json(json!({"idToken": token, "validDuration": 432_000})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionCookie": cookie})))
        .expect(1)
        .mount(&server)
        .await;

    let auth = registry(&server).get(&app(&server));

    let created = auth.create_session_cookie(&token, None).await.unwrap();
    assert_eq!(created, cookie);

    let decoded = auth.verify_session_cookie(&created).await.unwrap();
    assert_eq!(decoded.uid(), Some("alice"));
    assert_eq!(decoded.issued_at(), issued);
    assert_eq!(decoded.email(), "alice@example.com");
    assert!(decoded.is_email_verified());
    assert!(!auth.check_revoked(&decoded).await.unwrap());

    let user = auth
        .verify_session_cookie_and_check_revoked(&created)
        .await
        .unwrap();
    assert_eq!(user.uid, "alice");
    assert_eq!(user.tokens_valid_after_millis, 0);
}

#[tokio::test]
async fn revoked_session_cookie() {
    let server = MockServer::start().await;
    serve_keys(&server, "/sessionCookiePublicKeys", JWKS).await;

    let issued = now() - 120;
    let revoked_at = issued + 60;
    serve_account(&server, revoked_at).await;

    Mock::given(method("POST"))
        .and(path("/relyingparty/setAccountInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"localId": "alice"})))
        .expect(1)
        .mount(&server)
        .await;

    let auth = registry(&server).get(&app(&server));
    auth.revoke_refresh_tokens("alice").await.unwrap();

    let cookie = session_cookie("alice", issued);
    let decoded = auth.verify_session_cookie(&cookie).await.unwrap();
    assert!(auth.check_revoked(&decoded).await.unwrap());

    let err = auth
        .verify_session_cookie_and_check_revoked(&cookie)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Revoked));
    assert!(err.requires_reauthentication());

    // issued in the revocation second itself: still valid
    let cookie = session_cookie("alice", revoked_at);
    assert!(auth.verify_session_cookie_and_check_revoked(&cookie).await.is_ok());
}

#[tokio::test]
async fn custom_token_round_trip() {
    let server = MockServer::start().await;
    serve_keys(&server, &format!("/jwk/{CLIENT_EMAIL}"), JWKS).await;

    let auth = registry(&server).get(&app(&server));
    let claims = Claims::new().with("role", "admin");
    let token = auth.create_custom_token("alice", Some(&claims)).unwrap();

    let decoded = auth.verify_custom_token(&token).await.unwrap();
    assert_eq!(decoded.uid(), Some("alice"));
    assert_eq!(decoded.issuer(), CLIENT_EMAIL);
    assert_eq!(decoded.claims().get_str("role"), Some("admin"));
    assert_eq!(decoded.expires_at() - decoded.issued_at(), 3600);
}

#[tokio::test]
async fn key_rotation_refetches_unknown_kid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idTokenKeys"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=3600")
                .set_body_string(JWKS),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve_keys(&server, "/idTokenKeys", ROTATED_JWKS).await;

    let registry = registry_with_refetch_interval(&server, Duration::ZERO);
    let auth = registry.get(&app(&server));
    let issued = now() - 5;

    auth.verify_id_token(&id_token("alice", issued)).await.unwrap();

    let rotated = sign(
        &credential("https://securetoken.google.com/", "bob", issued),
        "test-key-2",
        ROTATED_PRIVATE_KEY,
    );
    let decoded = auth.verify_id_token(&rotated).await.unwrap();
    assert_eq!(decoded.uid(), Some("bob"));
    assert_eq!(registry.key_sets().id_tokens.fetch_count(), 2);
}

#[tokio::test]
async fn shared_caches_across_apps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idTokenKeys"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=3600")
                .set_body_string(JWKS),
        )
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server);
    let first = registry.get(&app(&server));
    let second = registry.get(&App::new("secondary", app(&server).options().clone()));

    let token = id_token("alice", now() - 5);
    first.verify_id_token(&token).await.unwrap();
    second.verify_id_token(&token).await.unwrap();
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn backend_errors_surface() {
    let server = MockServer::start().await;
    serve_keys(&server, "/idTokenKeys", JWKS).await;
    Mock::given(method("POST"))
        .and(path("/relyingparty/getAccountInfo"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "USER_NOT_FOUND"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/relyingparty/deleteAccount"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"code": 500, "message": "INTERNAL_ERROR"}
        })))
        .mount(&server)
        .await;

    let auth = registry(&server).get(&app(&server));
    assert!(matches!(auth.get_user("ghost").await, Err(Error::UserNotFound)));
    assert!(matches!(
        auth.get_user_by_email("ghost@example.com").await,
        Err(Error::UserNotFound)
    ));

    let err = auth.delete_user("alice").await.unwrap_err();
    assert!(err.is_retryable());

    assert!(matches!(
        auth.create_session_cookie(&id_token("alice", now() - 5), Some(Duration::from_secs(60)))
            .await,
        Err(Error::InvalidSessionDuration(60))
    ));
}
