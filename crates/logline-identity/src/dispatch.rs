//! Authenticated JSON calls against the identity backend.

use crate::token_source::TokenSource;
use crate::{Error, Result};

use reqwest::Method;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Longest slice of a backend body carried in an error.
const MAX_EXCERPT_CHARS: usize = 200;

/// Description of one remote operation: where it lives and how its
/// request and response are checked.
pub struct RequestSpec<Req, Resp> {
    /// HTTP method of the call.
    pub method: Method,
    /// Path appended to the dispatcher's base URL, without a leading slash.
    pub endpoint: &'static str,
    /// Runs before any token is fetched or anything is sent.
    pub validate_request: fn(&Req) -> Result<()>,
    /// Runs on the decoded response body.
    pub validate_response: fn(&Resp) -> Result<()>,
}

impl<Req, Resp> std::fmt::Debug for RequestSpec<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSpec")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Validator that accepts anything.
pub fn accept<T>(_: &T) -> Result<()> {
    Ok(())
}

#[derive(serde::Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Sends [`RequestSpec`] calls with a bearer token.
#[derive(Clone)]
pub struct RequestDispatcher {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    /// Dispatcher sending to `base_url` with bearer tokens from `tokens`.
    /// Trailing slashes of `base_url` are dropped.
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http,
            base_url,
            tokens,
            timeout: None,
        }
    }

    /// Per-call timeout, on top of whatever the client enforces.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Base URL every endpoint is appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Validate, send and decode one call.
    ///
    /// A `USER_NOT_FOUND` rejection maps to [`Error::UserNotFound`]; any other
    /// non-2xx status to [`Error::BackendRejected`]. A body that does not
    /// decode as `Resp` is [`Error::IllegalType`].
    #[instrument(skip_all, fields(endpoint = spec.endpoint))]
    pub async fn call<Req, Resp>(
        &self,
        spec: &RequestSpec<Req, Resp>,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        (spec.validate_request)(request)?;

        let token = self.tokens.token().await?;
        let url = format!("{}/{}", self.base_url, spec.endpoint);

        let mut builder = self
            .http
            .request(spec.method.clone(), &url)
            .bearer_auth(token.expose_secret())
            .json(request);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await.map_err(|e| {
            tracing::warn!(target: "identity.dispatch", error = %e, "request failed");
            Error::Transport(e)
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(Error::Transport)?;

        if !status.is_success() {
            let err = rejection(status.as_u16(), &body);
            tracing::debug!(
                target: "identity.dispatch",
                status = status.as_u16(),
                error = %err,
                "backend rejected call"
            );
            return Err(err);
        }

        let decoded: Resp = serde_json::from_str(&body).map_err(|e| {
            Error::IllegalType(format!("unexpected response from {}: {e}", spec.endpoint))
        })?;
        (spec.validate_response)(&decoded)?;
        Ok(decoded)
    }
}

fn rejection(status: u16, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| excerpt(body));

    if message.starts_with("USER_NOT_FOUND") {
        Error::UserNotFound
    } else {
        Error::BackendRejected { status, message }
    }
}

/// First few characters of a response body, for error messages.
pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
