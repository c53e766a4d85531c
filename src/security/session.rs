//! Cookie-backed sessions and their CSRF tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::http::SetCookie;
use crate::http::cookie;

/// Base name of the session cookie.
pub const COOKIE_NAME: &str = "session_id";

/// Lifetime of the session cookie: 30 days, in seconds.
pub const SESSION_MAX_AGE_SECS: u64 = 30 * 24 * 3600;

/// Returns the session cookie name for an optional prefix:
/// `session_id`, or `<prefix>_session_id`.
pub fn cookie_name(prefix: &str) -> String {
    if prefix.is_empty() {
        COOKIE_NAME.to_owned()
    } else {
        format!("{prefix}_{COOKIE_NAME}")
    }
}

/// Builds the `Set-Cookie` directive that hands `cookie_id` to the client.
pub fn session_cookie(name: &str, cookie_id: &str, secure: bool) -> SetCookie {
    SetCookie::new(name, cookie::escape(cookie_id))
        .path("/")
        .max_age(SESSION_MAX_AGE_SECS)
        .http_only(true)
        .secure(secure)
}

/// A client session, identified by the value of its session cookie.
///
/// The default value is the empty session: no cookie, and a CSRF token
/// that no request can ever match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    cookie_id: String,
}

impl Session {
    pub fn new(cookie_id: impl Into<String>) -> Self {
        Self {
            cookie_id: cookie_id.into(),
        }
    }

    pub fn cookie_id(&self) -> &str {
        &self.cookie_id
    }

    pub fn is_empty(&self) -> bool {
        self.cookie_id.is_empty()
    }

    /// Returns the CSRF token bound to this session.
    ///
    /// The token is a one-way digest of the cookie identifier, so pages can
    /// embed it without exposing the HttpOnly cookie. Empty for the empty
    /// session.
    pub fn csrf_token(&self) -> String {
        if self.cookie_id.is_empty() {
            return String::new();
        }
        let mut hasher = Sha256::new();
        hasher.update(b"csrf:");
        hasher.update(self.cookie_id.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Checks a submitted CSRF token against this session's token without
    /// stopping at the first differing byte. Never true for the empty session.
    pub fn verify_csrf(&self, sent: &str) -> bool {
        let expected = self.csrf_token();
        !expected.is_empty() && constant_time_eq(expected.as_bytes(), sent.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = u64::try_from(a.len() ^ b.len()).unwrap_or(u64::MAX);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= u64::from(x ^ y);
    }
    diff == 0
}
