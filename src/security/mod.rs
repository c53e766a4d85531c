//! Security primitives: session identifiers, sessions and CSRF tokens.
//!
//! - [`TokenService`] / [`HmacTokens`] — issue and validate signed session identifiers.
//! - [`Session`] — the per-request session and its derived CSRF token.
//!
//! Gates that use these (CSRF rejection, login checks) live in the dispatcher.

pub mod session;
pub mod token;

pub use session::{COOKIE_NAME, SESSION_MAX_AGE_SECS, Session, cookie_name};
pub use token::{HmacTokens, TokenError, TokenService};
