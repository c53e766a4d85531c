//! Cookie header parsing and `Set-Cookie` serialization.

use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Characters left untouched when escaping a cookie value. Everything else
/// is percent-encoded, matching query-string escaping.
const COOKIE_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-escapes `value` for use in a cookie or query string.
pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, COOKIE_VALUE).to_string()
}

/// Reverses [`escape`]. `+` is read as a space; invalid UTF-8 is replaced.
pub fn unescape(value: &str) -> String {
    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Iterates `(name, raw_value)` pairs of a `Cookie` request header value.
pub fn parse_pairs(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        let value = value.trim().trim_matches('"');
        Some((name.trim(), value))
    })
}

/// A `Set-Cookie` response directive.
///
/// # Examples
///
/// ```
/// use porch::http::SetCookie;
///
/// let cookie = SetCookie::new("session_id", "abc")
///     .path("/")
///     .max_age(60)
///     .http_only(true);
/// assert_eq!(cookie.to_string(), "session_id=abc; Path=/; Max-Age=60; HttpOnly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    name: String,
    value: String,
    path: Option<String>,
    max_age: Option<u64>,
    http_only: bool,
    secure: bool,
}

impl SetCookie {
    /// Creates a cookie. `value` is written verbatim; escape it first if
    /// it may contain separators.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            max_age: None,
            http_only: false,
            secure: false,
        }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets `Max-Age` in seconds.
    #[must_use]
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn max_age_secs(&self) -> Option<u64> {
        self.max_age
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={max_age}")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}
