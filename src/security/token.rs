//! Session identifier issuance and validation.
//!
//! The dispatcher only relies on the [`TokenService`] contract: issue an
//! identifier bound to a secret key, and later tell whether a presented
//! identifier was issued under that key. [`HmacTokens`] is the default
//! implementation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of the random part of an [`HmacTokens`] identifier.
const NONCE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("secret key rejected by the signer")]
    InvalidKey,
}

/// Issues and validates session identifiers bound to a secret key.
///
/// Implementations are shared by every connection task, so they must be
/// `Send + Sync` and must not rely on per-request state.
pub trait TokenService: Send + Sync {
    /// Issues a fresh identifier signed with `key`.
    fn issue(&self, key: &str) -> Result<String, TokenError>;

    /// Returns `true` if `token` was issued under `key`.
    fn validate(&self, token: &str, key: &str) -> bool;
}

/// HMAC-SHA256 signed identifiers of the form `<nonce>.<signature>`.
///
/// The nonce is 32 random alphanumerics; the signature is the URL-safe,
/// unpadded base64 HMAC of the nonce. Tokens need no server-side storage
/// and never contain characters that require cookie escaping.
///
/// # Examples
///
/// ```
/// use porch::security::{HmacTokens, TokenService};
///
/// let tokens = HmacTokens;
/// let id = tokens.issue("secret").unwrap();
/// assert!(tokens.validate(&id, "secret"));
/// assert!(!tokens.validate(&id, "other"));
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacTokens;

impl HmacTokens {
    fn mac(key: &str) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| TokenError::InvalidKey)
    }
}

impl TokenService for HmacTokens {
    fn issue(&self, key: &str) -> Result<String, TokenError> {
        let nonce: String = rand::rng()
            .sample_iter(&rand::distr::Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();

        let mut mac = Self::mac(key)?;
        mac.update(nonce.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{nonce}.{signature}"))
    }

    fn validate(&self, token: &str, key: &str) -> bool {
        let Some((nonce, signature)) = token.split_once('.') else {
            return false;
        };
        if nonce.len() != NONCE_LEN {
            return false;
        }
        let Ok(signature) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = Self::mac(key) else {
            return false;
        };
        mac.update(nonce.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_validate_under_same_key() {
        let id = HmacTokens.issue("k1").unwrap();
        assert!(HmacTokens.validate(&id, "k1"));
        assert!(!HmacTokens.validate(&id, "k2"));
    }

    #[test]
    fn issued_tokens_are_unique() {
        let a = HmacTokens.issue("k").unwrap();
        let b = HmacTokens.issue("k").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_nonce_is_rejected() {
        let id = HmacTokens.issue("k").unwrap();
        let (nonce, sig) = id.split_once('.').unwrap();
        let mut chars: Vec<char> = nonce.chars().collect();
        chars[0] = if chars[0] == 'a' { 'b' } else { 'a' };
        let forged = format!("{}.{sig}", chars.into_iter().collect::<String>());
        assert!(!HmacTokens.validate(&forged, "k"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(!HmacTokens.validate("", "k"));
        assert!(!HmacTokens.validate("no-dot", "k"));
        assert!(!HmacTokens.validate("short.sig", "k"));
        let nonce = "a".repeat(NONCE_LEN);
        assert!(!HmacTokens.validate(&format!("{nonce}.!!!"), "k"));
    }

    #[test]
    fn tokens_need_no_cookie_escaping() {
        let id = HmacTokens.issue("k").unwrap();
        assert_eq!(crate::http::cookie::escape(&id), id);
    }
}
