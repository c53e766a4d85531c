//! Request hooks: user code that runs around every dispatched request.
//!
//! All hooks are optional and injected once through [`Hooks`]. The
//! dispatcher never inspects the individual fields; it goes through the
//! `run_*`/`check_*` methods here, which define what an absent hook means:
//!
//! | Hook           | Runs                                   | When absent            |
//! |----------------|----------------------------------------|------------------------|
//! | `pre`          | after session setup, before routing     | nothing                |
//! | `post`         | after the route handler or fallbacks    | nothing                |
//! | `is_logged_in` | before handlers of login-only routes    | everyone is logged in  |
//! | `not_found`    | when every fallback came up empty       | `404 Not Found`        |
//! | `csrf_token`   | to compute `Helper["CsrfToken"]`        | session's own token    |
//!
//! [`CompletionLog`] is the scope guard that logs the end of every request.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::info;

use crate::StatusCode;
use crate::context::ResponseContext;
use crate::router::{BoxFuture, Handler};
use crate::security::Session;

/// Async login check. Returning `false` stops the request; the check is
/// expected to have written its own response (a redirect, usually).
pub type LoginCheck =
    Arc<dyn for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, bool> + Send + Sync + 'static>;

/// Maps a session identifier to the CSRF token exposed to templates.
pub type CsrfTokenFn = Arc<dyn Fn(&str) -> String + Send + Sync + 'static>;

/// The optional hook set of an application.
///
/// # Examples
///
/// ```rust,no_run
/// use porch::middleware::Hooks;
/// use porch::StatusCode;
///
/// let hooks = Hooks::new()
///     .pre(|ctx| Box::pin(async move {
///         ctx.helper.insert("SiteName".into(), "porch".into());
///     }))
///     .is_logged_in(|ctx| Box::pin(async move {
///         let logged_in = ctx.request().cookie("user").is_some();
///         if !logged_in {
///             ctx.set_redirect("/login");
///         }
///         logged_in
///     }))
///     .not_found(|ctx| Box::pin(async move {
///         ctx.set_response_code(StatusCode::NOT_FOUND);
///         ctx.write("nothing here");
///     }));
/// ```
#[derive(Clone, Default)]
pub struct Hooks {
    pre: Option<Handler>,
    post: Option<Handler>,
    is_logged_in: Option<LoginCheck>,
    not_found: Option<Handler>,
    csrf_token: Option<CsrfTokenFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs before routing. Setting a status or writing skips the route
    /// handler, the fallbacks and the post hook.
    #[must_use]
    pub fn pre<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.pre = Some(Arc::new(hook));
        self
    }

    /// Runs after the route handler or the fallback chain, including after
    /// a CSRF or login rejection.
    #[must_use]
    pub fn post<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn is_logged_in<F>(mut self, check: F) -> Self
    where
        F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, bool> + Send + Sync + 'static,
    {
        self.is_logged_in = Some(Arc::new(check));
        self
    }

    #[must_use]
    pub fn not_found<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.not_found = Some(Arc::new(hook));
        self
    }

    /// Overrides the CSRF token placed in `Helper["CsrfToken"]`. Validation
    /// still uses the session's own token.
    #[must_use]
    pub fn csrf_token<F>(mut self, derive: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.csrf_token = Some(Arc::new(derive));
        self
    }

    pub async fn run_pre(&self, ctx: &mut ResponseContext) {
        if let Some(hook) = &self.pre {
            hook(ctx).await;
        }
    }

    pub async fn run_post(&self, ctx: &mut ResponseContext) {
        if let Some(hook) = &self.post {
            hook(ctx).await;
        }
    }

    /// `true` when no login check is configured.
    pub async fn check_logged_in(&self, ctx: &mut ResponseContext) -> bool {
        match &self.is_logged_in {
            Some(check) => check(ctx).await,
            None => true,
        }
    }

    /// Last fallback stage. Does nothing if a response was already started.
    pub async fn run_not_found(&self, ctx: &mut ResponseContext) {
        if ctx.response_code_set() {
            return;
        }
        match &self.not_found {
            Some(hook) => hook(ctx).await,
            None => ctx.set_response_code(StatusCode::NOT_FOUND),
        }
    }

    pub fn csrf_token_for(&self, session: &Session) -> String {
        match &self.csrf_token {
            Some(derive) => derive(session.cookie_id()),
            None => session.csrf_token(),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("is_logged_in", &self.is_logged_in.is_some())
            .field("not_found", &self.not_found.is_some())
            .field("csrf_token", &self.csrf_token.is_some())
            .finish()
    }
}

/// Logs the end of a request when dropped, so the line is emitted on every
/// exit path of the dispatcher.
pub struct CompletionLog {
    path: String,
    started: Instant,
}

impl CompletionLog {
    pub fn new(path: impl Into<String>, started: Instant) -> Self {
        Self {
            path: path.into(),
            started,
        }
    }
}

impl Drop for CompletionLog {
    fn drop(&mut self) {
        info!(path = %self.path, elapsed = ?self.started.elapsed(), "handled request");
    }
}
