//! Per-request state.
//!
//! - [`RequestContext`] — read-only view of the inbound request.
//! - [`ResponseContext`] — the mutable aggregate one request flow owns:
//!   template data ([`Helper`]), session, matched route, and the response
//!   under construction.
//! - [`PathParams`] — variables captured by the matched route pattern.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::config::ServerConfig;
use crate::http::{Method, Request, Response, StatusCode};
use crate::realtime::{self, OnUpgrade, UpgradeError, Upgraded};
use crate::router::BoxFuture;
use crate::security::Session;
use crate::security::session::session_cookie;
use crate::template::{FALLBACK_TEMPLATE, RenderError};

/// Template data bag. Keys `URI` and `CsrfToken` are filled in by the
/// dispatcher; handlers add whatever their templates need.
pub type Helper = HashMap<String, serde_json::Value>;

/// Header carrying the CSRF token on script-driven requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Form field and query parameter carrying the CSRF token.
pub const CSRF_FIELD: &str = "csrf_token";

/// Why a request yielded no CSRF token.
#[derive(Debug, Error)]
pub enum CsrfTokenError {
    #[error("request carries no CSRF token")]
    Missing,

    #[error("form body is not valid UTF-8")]
    InvalidBody,
}

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Read-only wrapper around the inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request: Request,
}

impl RequestContext {
    pub fn new(request: Request) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.path()
    }

    /// The raw request target, query string included.
    pub fn uri(&self) -> &str {
        self.request.uri()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.request.cookie(name)
    }

    /// Returns the template name a request path maps to for auto-render.
    ///
    /// `/about` → `about`, `/` → `index`, `/blog/` → `blog/index`.
    pub fn potential_filename(&self) -> String {
        let name = self.path().trim_start_matches('/');
        if name.is_empty() {
            "index".to_owned()
        } else if name.ends_with('/') {
            format!("{name}index")
        } else {
            name.to_owned()
        }
    }

    /// Returns the CSRF token the client sent.
    ///
    /// Looks at the `X-CSRF-Token` header, then the `csrf_token` field of
    /// an urlencoded form body, then the `csrf_token` query parameter.
    pub fn csrf_token(&self) -> Result<String, CsrfTokenError> {
        if let Some(token) = self.request.headers().get(CSRF_HEADER) {
            return Ok(token.trim().to_owned());
        }
        if self.request.is_form() {
            let form = self.request.form().ok_or(CsrfTokenError::InvalidBody)?;
            if let Some(token) = form.get(CSRF_FIELD) {
                return Ok(token.clone());
            }
        }
        self.request
            .query_param(CSRF_FIELD)
            .map(str::to_owned)
            .ok_or(CsrfTokenError::Missing)
    }
}

/// Mutable state of a single request as it moves through the pipeline.
///
/// Exactly one exists per request and it is never shared between tasks.
/// Once a status code has been set or body bytes written,
/// [`response_code_set`](Self::response_code_set) stays `true` and the
/// dispatcher's fallback stages leave the response alone.
pub struct ResponseContext {
    /// Data handed to templates.
    pub helper: Helper,
    request: RequestContext,
    session: Session,
    server: Arc<AppState>,
    pattern: String,
    params: PathParams,
    response: Response,
    response_code_set: bool,
    started: Instant,
    upgrade: Option<OnUpgrade>,
}

impl ResponseContext {
    /// Wraps `request` with an empty session and a helper bag holding `URI`.
    pub fn new(request: Request, server: Arc<AppState>) -> Self {
        let mut helper = Helper::new();
        helper.insert("URI".to_owned(), request.uri().into());
        Self {
            helper,
            request: RequestContext::new(request),
            session: Session::default(),
            server,
            pattern: String::new(),
            params: PathParams::new(),
            response: Response::default(),
            response_code_set: false,
            started: Instant::now(),
            upgrade: None,
        }
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn server(&self) -> &Arc<AppState> {
        &self.server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.server.config
    }

    /// Pattern of the matched route; empty on the catch-all path.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Shorthand for `params().get(name)`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn set_route(&mut self, pattern: &str, params: PathParams) {
        self.pattern = pattern.to_owned();
        self.params = params;
    }

    // ── Session & CSRF ───────────────────────────────────────────────────────

    /// Recovers the session from its cookie, or starts a new one.
    pub fn init_session(&mut self) {
        let name = &self.server.cookie_name;
        let recovered = self
            .request
            .cookie(name)
            .filter(|id| !id.is_empty())
            .filter(|id| self.server.tokens.validate(id, &self.server.config.session_key));

        match recovered {
            Some(id) => self.session = Session::new(id),
            None => self.reset_or_create_session(),
        }
    }

    /// Issues a fresh session identifier and sends it to the client.
    ///
    /// If the token service fails the session is left empty.
    pub fn reset_or_create_session(&mut self) {
        let id = match self.server.tokens.issue(&self.server.config.session_key) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "could not issue session identifier");
                self.session = Session::default();
                return;
            }
        };
        let cookie = session_cookie(
            &self.server.cookie_name,
            &id,
            !self.server.config.insecure_cookie,
        );
        self.response.add_cookie(&cookie);
        self.session = Session::new(id);
    }

    /// The CSRF token pages should embed: the configured override applied to
    /// the session identifier, or the session's own token.
    pub fn csrf_token(&self) -> String {
        self.server.hooks.csrf_token_for(&self.session)
    }

    /// `true` iff the request carries the session's own CSRF token.
    ///
    /// Always compares against [`Session::csrf_token`], never the override,
    /// and always fails for an empty session.
    pub fn is_valid_csrf(&self) -> bool {
        matches!(self.request.csrf_token(), Ok(sent) if self.session.verify_csrf(&sent))
    }

    // ── Writing the response ─────────────────────────────────────────────────

    /// `true` once a status code was set or any body bytes were written.
    pub fn response_code_set(&self) -> bool {
        self.response_code_set
    }

    /// Sets the status code. Ignored if a status was already committed.
    pub fn set_response_code(&mut self, code: StatusCode) {
        if self.response_code_set {
            debug!(code = code.as_u16(), path = self.request.path(), "superfluous response code ignored");
            return;
        }
        self.response.set_status(code);
        self.response_code_set = true;
    }

    /// Appends text to the body, committing the current status.
    pub fn write(&mut self, body: impl AsRef<str>) {
        self.write_bytes(body.as_ref().as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.response_code_set = true;
        self.response.append_body(bytes);
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response.set_header(name, value);
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response.add_header(name, value);
    }

    /// Answers `302 Found` pointing at `location`.
    pub fn set_redirect(&mut self, location: impl Into<String>) {
        self.set_header("Location", location);
        self.set_response_code(StatusCode::FOUND);
    }

    /// Writes `value` as a JSON body.
    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.set_header("Content-Type", "application/json");
        self.write_bytes(&body);
        Ok(())
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    // ── Templates ────────────────────────────────────────────────────────────

    /// Renders the template named after the request path.
    pub async fn render(&mut self) -> Result<(), RenderError> {
        let name = self.request.potential_filename();
        self.render_template(&name).await
    }

    /// Renders `<name>.html`, or the `404.html` fallback if that is missing,
    /// with the helper bag as data.
    ///
    /// Failures are logged and returned; nothing is written and no status is
    /// set in that case.
    pub async fn render_template(&mut self, name: &str) -> Result<(), RenderError> {
        let Some(templates) = self.server.templates.clone() else {
            return Err(RenderError::Unconfigured);
        };
        let candidates = vec![format!("{name}.html"), FALLBACK_TEMPLATE.to_owned()];
        let helper = self.helper.clone();

        let rendered = tokio::task::spawn_blocking(move || templates.render(&candidates, &helper))
            .await
            .map_err(|e| RenderError::Aborted(e.to_string()))
            .and_then(|r| r);

        match rendered {
            Ok(body) => {
                self.set_header("Content-Type", "text/html; charset=utf-8");
                self.write(body);
                Ok(())
            }
            Err(e) => {
                warn!(template = name, error = %e, "template render failed");
                Err(e)
            }
        }
    }

    // ── Upgrades ─────────────────────────────────────────────────────────────

    /// Accepts a WebSocket handshake. Once the `101` response is flushed,
    /// the listener hands the raw connection to `on_upgrade`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError`] without writing anything if the request is
    /// not a valid version 13 handshake or a response was already started.
    pub fn upgrade_websocket<F, Fut>(&mut self, on_upgrade: F) -> Result<(), UpgradeError>
    where
        F: FnOnce(Upgraded) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.response_code_set {
            return Err(UpgradeError::AlreadyResponded);
        }
        let accept = realtime::accept_handshake(self.request.request().headers())?;
        self.set_header("Upgrade", "websocket");
        self.set_header("Connection", "Upgrade");
        self.set_header("Sec-WebSocket-Accept", accept);
        self.set_response_code(StatusCode::SWITCHING_PROTOCOLS);
        self.upgrade = Some(Box::new(move |upgraded| -> BoxFuture<'static, ()> {
            Box::pin(on_upgrade(upgraded))
        }));
        Ok(())
    }

    /// Consumes the context, yielding what the listener should send.
    pub fn into_parts(self) -> (Response, Option<OnUpgrade>) {
        (self.response, self.upgrade)
    }
}
