//! `Set-Cookie` headers for session cookies.

use crate::{Error, Result};
use httpdate::fmt_http_date;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cookie name most hosting front ends pass through to the backend.
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "__session";

/// SameSite attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// Same-site requests only.
    Strict,
    /// Also top-level navigations from other sites.
    Lax,
    /// Every request; requires `Secure`.
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Attributes of the session cookie.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    /// Cookie name (without any prefix).
    pub name: String,

    /// Path scope.
    pub path: String,

    /// Domain scope; host-only when `None`.
    pub domain: Option<String>,

    /// Send on HTTPS only.
    pub secure: bool,

    /// Not accessible to JS.
    pub http_only: bool,

    /// Cross-site policy.
    pub same_site: SameSite,

    /// If true and `domain` is None, the cookie name is prefixed with `__Host-`,
    /// which requires `path=/` and `secure=true`.
    pub use_host_prefix: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            path: "/".to_string(),
            domain: None,
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            use_host_prefix: false,
        }
    }
}

fn cookie_name(opts: &CookieOptions) -> Result<String> {
    if opts.name.is_empty() || opts.name.contains(['=', ';', ' ']) {
        return Err(Error::Config(format!("invalid cookie name {:?}", opts.name)));
    }
    if opts.same_site == SameSite::None && !opts.secure {
        return Err(Error::Config(
            "SameSite=None cookies must be Secure".to_string(),
        ));
    }
    if opts.use_host_prefix && opts.domain.is_none() {
        if opts.path != "/" {
            return Err(Error::Config(
                "__Host- cookies must have Path=/".to_string(),
            ));
        }
        if !opts.secure {
            return Err(Error::Config(
                "__Host- cookies must be Secure".to_string(),
            ));
        }
        Ok(format!(
            "__Host-{}",
            opts.name.trim_start_matches("__Host-")
        ))
    } else {
        Ok(opts.name.clone())
    }
}

fn attributes(name: &str, value: &str, opts: &CookieOptions) -> Vec<String> {
    let mut parts = vec![format!("{name}={value}"), format!("Path={}", opts.path)];
    if let Some(domain) = &opts.domain {
        parts.push(format!("Domain={domain}"));
    }
    if opts.secure {
        parts.push("Secure".to_string());
    }
    if opts.http_only {
        parts.push("HttpOnly".to_string());
    }
    parts.push(format!("SameSite={}", opts.same_site.as_str()));
    parts
}

/// `Set-Cookie` value carrying a session cookie that lives for `duration`,
/// the lifetime it was created with.
pub fn build_session_cookie(
    cookie: &str,
    duration: Duration,
    opts: &CookieOptions,
) -> Result<String> {
    build_session_cookie_at(cookie, duration, opts, SystemTime::now())
}

fn build_session_cookie_at(
    cookie: &str,
    duration: Duration,
    opts: &CookieOptions,
    now: SystemTime,
) -> Result<String> {
    let name = cookie_name(opts)?;
    let mut parts = attributes(&name, cookie, opts);
    parts.push(format!("Max-Age={}", duration.as_secs()));
    // Expires for older clients.
    parts.push(format!("Expires={}", fmt_http_date(now + duration)));
    Ok(parts.join("; "))
}

/// `Set-Cookie` value that removes the session cookie.
pub fn build_clear_cookie(opts: &CookieOptions) -> Result<String> {
    let name = cookie_name(opts)?;
    let mut parts = attributes(&name, "", opts);
    parts.push("Max-Age=0".to_string());
    parts.push(format!("Expires={}", fmt_http_date(UNIX_EPOCH)));
    Ok(parts.join("; "))
}
