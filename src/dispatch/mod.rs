//! The request lifecycle pipeline.
//!
//! ```text
//! match route ──(strict-slash redirect)──────────────────────────▶ 301
//!     │
//! build context ─▶ session init ─▶ pre hook ──(response started)──▶ done
//!     │
//!     ├─ route found ─▶ CSRF gate ─▶ login gate ─▶ handler ──┐
//!     └─ catch-all ──▶ static file ─▶ auto-render ─▶ 404 ────┤
//!                                                            ▼
//!                                                       post hook ─▶ done
//! ```
//!
//! Every stage after the pre hook checks
//! [`response_code_set`](ResponseContext::response_code_set) before writing,
//! so at most one stage produces the response. The "handled request" log
//! line is emitted by a [`CompletionLog`] guard on every exit path.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::context::ResponseContext;
use crate::http::{Request, Response, StatusCode};
use crate::middleware::CompletionLog;
use crate::realtime::OnUpgrade;
use crate::router::{Route, RouteMatch, RouteTable};
use crate::static_files::StaticResolver;

/// What the listener writes back for one request.
pub struct Reply {
    pub response: Response,
    /// Set when the handler accepted a WebSocket upgrade.
    pub upgrade: Option<OnUpgrade>,
}

impl Reply {
    fn redirect(location: String) -> Self {
        Self {
            response: Response::new(StatusCode::MOVED_PERMANENTLY).header("Location", location),
            upgrade: None,
        }
    }
}

impl From<ResponseContext> for Reply {
    fn from(ctx: ResponseContext) -> Self {
        let (response, upgrade) = ctx.into_parts();
        Self { response, upgrade }
    }
}

// Outcome of the route gates.
enum Gate {
    Open,
    CsrfRejected,
    LoginRejected,
}

/// Runs requests through the pipeline. Immutable and shared by every
/// connection task.
pub struct Dispatcher {
    state: Arc<AppState>,
    routes: RouteTable,
    statics: Option<StaticResolver>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>, routes: RouteTable, statics: Option<StaticResolver>) -> Self {
        Self {
            state,
            routes,
            statics,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn serves_static_files(&self) -> bool {
        self.statics.is_some()
    }

    /// Handles one request from start to finish.
    pub async fn dispatch(&self, request: Request) -> Reply {
        let _done = CompletionLog::new(request.path(), Instant::now());
        let config = &self.state.config;

        let found = match self.routes.resolve(
            request.method(),
            request.path(),
            request.query_string(),
            config.strict_slash,
        ) {
            RouteMatch::Found { route, params } => Some((route, params)),
            RouteMatch::CatchAll => None,
            RouteMatch::Redirect(location) => {
                debug!(from = request.path(), to = %location, "strict slash redirect");
                return Reply::redirect(location);
            }
        };

        let mut ctx = self.build_context(request);

        self.state.hooks.run_pre(&mut ctx).await;
        if ctx.response_code_set() {
            debug!(path = ctx.request().path(), "pre hook answered the request");
            return ctx.into();
        }

        match found {
            Some((route, params)) => {
                ctx.set_route(route.pattern(), params);
                self.run_route(route, &mut ctx).await;
            }
            None => self.run_fallback(&mut ctx).await,
        }

        self.state.hooks.run_post(&mut ctx).await;
        ctx.into()
    }

    /// Creates the request's context and, with sessions on, recovers or
    /// issues its session and exposes the CSRF token to templates.
    pub fn build_context(&self, request: Request) -> ResponseContext {
        let mut ctx = ResponseContext::new(request, Arc::clone(&self.state));
        if self.state.config.use_sessions {
            ctx.init_session();
            let token = ctx.csrf_token();
            ctx.helper.insert("CsrfToken".to_owned(), token.into());
        }
        ctx
    }

    async fn run_route(&self, route: &Route, ctx: &mut ResponseContext) {
        match self.gate(route, ctx).await {
            Gate::Open => route.call(ctx).await,
            Gate::CsrfRejected => {
                warn!(path = ctx.request().path(), pattern = route.pattern(), "invalid CSRF token");
                ctx.set_response_code(StatusCode::FORBIDDEN);
            }
            Gate::LoginRejected => {
                debug!(path = ctx.request().path(), "login required");
            }
        }
    }

    async fn gate(&self, route: &Route, ctx: &mut ResponseContext) -> Gate {
        if route.is_csrf_protected() && !ctx.is_valid_csrf() {
            return Gate::CsrfRejected;
        }
        if route.is_login_required() && !self.state.hooks.check_logged_in(ctx).await {
            return Gate::LoginRejected;
        }
        Gate::Open
    }

    // Static file, then auto-render, then not-found.
    async fn run_fallback(&self, ctx: &mut ResponseContext) {
        if ctx.response_code_set() {
            return;
        }

        if let Some(statics) = &self.statics {
            if statics.try_serve(ctx).await {
                return;
            }
        }

        let config = &self.state.config;
        if config.use_auto_render && self.state.templates.is_some() && ctx.render().await.is_ok() {
            return;
        }

        self.state.hooks.run_not_found(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::config::ServerConfig;
    use crate::middleware::Hooks;
    use crate::security::Session;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn get(path: &str) -> Request {
        request(&format!("GET {path} HTTP/1.1\r\n\r\n"))
    }

    fn write_route(pattern: &str, body: &'static str) -> Route {
        Route::new(pattern, move |ctx| {
            Box::pin(async move {
                ctx.write(body);
            })
        })
    }

    fn session_config() -> ServerConfig {
        ServerConfig {
            use_sessions: true,
            session_key: "dispatch-key".into(),
            insecure_cookie: true,
            ..ServerConfig::default()
        }
    }

    fn set_cookie_id(reply: &Reply) -> String {
        let header = reply.response.headers().get("set-cookie").unwrap();
        let pair = header.split(';').next().unwrap();
        pair.split_once('=').unwrap().1.to_owned()
    }

    #[tokio::test]
    async fn first_registered_route_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let d = App::new(ServerConfig::default())
            .route(Route::new("/items/{id}", move |ctx| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.write("by id");
                })
            }))
            .route(write_route("/items/new", "new form"))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/items/new")).await;
        assert_eq!(reply.response.text(), "by id");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn path_params_reach_the_handler() {
        let d = App::new(ServerConfig::default())
            .route(Route::new("/users/{id}", |ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").unwrap_or_default().to_owned();
                    let pattern = ctx.pattern().to_owned();
                    ctx.write(format!("{pattern} {id}"));
                })
            }))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/users/42")).await;
        assert_eq!(reply.response.text(), "/users/{id} 42");
    }

    #[tokio::test]
    async fn no_route_and_no_fallbacks_is_404() {
        let d = App::new(ServerConfig::default()).build().unwrap();
        let reply = d.dispatch(get("/nothing")).await;
        assert_eq!(reply.response.status(), StatusCode::NOT_FOUND);
        assert!(reply.response.body_ref().is_empty());
    }

    #[tokio::test]
    async fn csrf_rejection_is_403_and_post_runs_once() {
        let handled = Arc::new(AtomicUsize::new(0));
        let posts = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&handled);
        let p = Arc::clone(&posts);
        let d = App::new(session_config())
            .route(
                Route::new("/post", move |ctx| {
                    let h = Arc::clone(&h);
                    Box::pin(async move {
                        h.fetch_add(1, Ordering::SeqCst);
                        ctx.write("posted");
                    })
                })
                .csrf_protect(true),
            )
            .hooks(Hooks::new().post(move |_ctx| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    p.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .build()
            .unwrap();

        let reply = d.dispatch(request("POST /post HTTP/1.1\r\n\r\n")).await;
        assert_eq!(reply.response.status(), StatusCode::FORBIDDEN);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
        assert_eq!(posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_csrf_token_reaches_handler() {
        let d = App::new(session_config())
            .route(write_route("/post", "posted").csrf_protect(true))
            .build()
            .unwrap();

        let first = d.dispatch(get("/")).await;
        let id = set_cookie_id(&first);
        let token = Session::new(id.clone()).csrf_token();

        let body = format!("csrf_token={token}");
        let raw = format!(
            "POST /post HTTP/1.1\r\nCookie: session_id={id}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let reply = d.dispatch(request(&raw)).await;
        assert_eq!(reply.response.status(), StatusCode::OK);
        assert_eq!(reply.response.text(), "posted");
    }

    #[tokio::test]
    async fn csrf_protected_route_rejects_without_sessions() {
        let d = App::new(ServerConfig::default())
            .route(write_route("/post", "posted").csrf_protect(true))
            .build()
            .unwrap();
        let reply = d
            .dispatch(request("POST /post HTTP/1.1\r\nX-CSRF-Token: x\r\n\r\n"))
            .await;
        assert_eq!(reply.response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn session_round_trip_keeps_identifier() {
        let d = App::new(session_config())
            .route(Route::new("/", |ctx| {
                Box::pin(async move {
                    let token = ctx.helper["CsrfToken"].clone();
                    ctx.write(token.as_str().unwrap_or_default());
                })
            }))
            .build()
            .unwrap();

        let first = d.dispatch(get("/")).await;
        let id = set_cookie_id(&first);
        assert_eq!(first.response.text(), Session::new(id.clone()).csrf_token());

        let second = d
            .dispatch(request(&format!("GET / HTTP/1.1\r\nCookie: session_id={id}\r\n\r\n")))
            .await;
        assert!(second.response.headers().get("set-cookie").is_none());
        assert_eq!(second.response.text(), first.response.text());
    }

    #[tokio::test]
    async fn csrf_override_only_changes_helper() {
        let d = App::new(session_config())
            .route(Route::new("/", |ctx| {
                Box::pin(async move {
                    let token = ctx.helper["CsrfToken"].clone();
                    ctx.write(token.as_str().unwrap_or_default());
                })
            }))
            .hooks(Hooks::new().csrf_token(|id| format!("custom-{}", id.len())))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/")).await;
        assert!(reply.response.text().starts_with("custom-"));
    }

    #[tokio::test]
    async fn login_gate_skips_handler() {
        let d = App::new(ServerConfig::default())
            .route(write_route("/account", "secret").needs_login(true))
            .route(write_route("/public", "hello"))
            .hooks(Hooks::new().is_logged_in(|ctx| {
                Box::pin(async move {
                    ctx.set_redirect("/login");
                    false
                })
            }))
            .build()
            .unwrap();

        let reply = d.dispatch(get("/account")).await;
        assert_eq!(reply.response.status(), StatusCode::FOUND);
        assert_eq!(reply.response.headers().get("location"), Some("/login"));
        assert!(reply.response.body_ref().is_empty());

        let reply = d.dispatch(get("/public")).await;
        assert_eq!(reply.response.text(), "hello");
    }

    #[tokio::test]
    async fn login_required_without_check_is_open() {
        let d = App::new(ServerConfig::default())
            .route(write_route("/account", "secret").needs_login(true))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/account")).await;
        assert_eq!(reply.response.text(), "secret");
    }

    #[tokio::test]
    async fn pre_hook_short_circuit_skips_everything_else() {
        let posts = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&posts);
        let d = App::new(ServerConfig::default())
            .route(write_route("/", "handler"))
            .hooks(
                Hooks::new()
                    .pre(|ctx| {
                        Box::pin(async move {
                            ctx.set_response_code(StatusCode::SERVICE_UNAVAILABLE);
                            ctx.write("maintenance");
                        })
                    })
                    .post(move |_ctx| {
                        let p = Arc::clone(&p);
                        Box::pin(async move {
                            p.fetch_add(1, Ordering::SeqCst);
                        })
                    }),
            )
            .build()
            .unwrap();

        let reply = d.dispatch(get("/")).await;
        assert_eq!(reply.response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(reply.response.text(), "maintenance");
        assert_eq!(posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pre_hook_helper_data_reaches_handler() {
        let d = App::new(ServerConfig::default())
            .route(Route::new("/", |ctx| {
                Box::pin(async move {
                    let site = ctx.helper["Site"].as_str().unwrap_or_default().to_owned();
                    ctx.write(site);
                })
            }))
            .hooks(Hooks::new().pre(|ctx| {
                Box::pin(async move {
                    ctx.helper.insert("Site".into(), "porch".into());
                })
            }))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/")).await;
        assert_eq!(reply.response.text(), "porch");
    }

    #[tokio::test]
    async fn post_hook_runs_after_fallbacks() {
        let d = App::new(ServerConfig::default())
            .hooks(Hooks::new().post(|ctx| {
                Box::pin(async move {
                    ctx.set_header("X-Post", "yes");
                })
            }))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/missing")).await;
        assert_eq!(reply.response.status(), StatusCode::NOT_FOUND);
        assert_eq!(reply.response.headers().get("x-post"), Some("yes"));
    }

    #[tokio::test]
    async fn static_file_wins_over_template() {
        let statics = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        fs::write(statics.path().join("app.js"), "console.log(1)").unwrap();
        fs::write(templates.path().join("404.html"), "template").unwrap();

        let d = App::new(ServerConfig {
            static_files_dir: Some(statics.path().to_owned()),
            templates_dir: Some(templates.path().to_owned()),
            use_auto_render: true,
            ..ServerConfig::default()
        })
        .build()
        .unwrap();

        let reply = d.dispatch(get("/app-1700000000.js")).await;
        assert_eq!(reply.response.text(), "console.log(1)");
        assert_eq!(
            reply.response.headers().get("content-type"),
            Some("text/javascript; charset=utf-8")
        );

        let reply = d.dispatch(get("/about")).await;
        assert_eq!(reply.response.text(), "template");
    }

    #[tokio::test]
    async fn auto_render_uses_request_path() {
        let templates = tempfile::tempdir().unwrap();
        fs::create_dir(templates.path().join("blog")).unwrap();
        fs::write(templates.path().join("index.html"), "home {% if URI %}with uri{% endif %}").unwrap();
        fs::write(templates.path().join("blog/index.html"), "blog").unwrap();

        let d = App::new(ServerConfig {
            templates_dir: Some(templates.path().to_owned()),
            use_auto_render: true,
            ..ServerConfig::default()
        })
        .build()
        .unwrap();

        let reply = d.dispatch(get("/?a=1")).await;
        assert_eq!(reply.response.text(), "home with uri");
        assert_eq!(
            reply.response.headers().get("content-type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(d.dispatch(get("/blog/")).await.response.text(), "blog");
    }

    #[tokio::test]
    async fn auto_render_off_goes_to_not_found() {
        let templates = tempfile::tempdir().unwrap();
        fs::write(templates.path().join("about.html"), "about").unwrap();

        let d = App::new(ServerConfig {
            templates_dir: Some(templates.path().to_owned()),
            ..ServerConfig::default()
        })
        .build()
        .unwrap();
        let reply = d.dispatch(get("/about")).await;
        assert_eq!(reply.response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_render_falls_through_to_not_found_hook() {
        let templates = tempfile::tempdir().unwrap();
        let d = App::new(ServerConfig {
            templates_dir: Some(templates.path().to_owned()),
            use_auto_render: true,
            ..ServerConfig::default()
        })
        .hooks(Hooks::new().not_found(|ctx| {
            Box::pin(async move {
                ctx.set_response_code(StatusCode::NOT_FOUND);
                ctx.write("custom 404");
            })
        }))
        .build()
        .unwrap();
        let reply = d.dispatch(get("/missing")).await;
        assert_eq!(reply.response.status(), StatusCode::NOT_FOUND);
        assert_eq!(reply.response.text(), "custom 404");
    }

    #[tokio::test]
    async fn strict_slash_redirects_before_pipeline() {
        let pres = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pres);
        let d = App::new(ServerConfig {
            strict_slash: true,
            ..ServerConfig::default()
        })
        .route(write_route("/docs", "docs"))
        .hooks(Hooks::new().pre(move |_ctx| {
            let p = Arc::clone(&p);
            Box::pin(async move {
                p.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .build()
        .unwrap();

        let reply = d.dispatch(get("/docs/?page=2")).await;
        assert_eq!(reply.response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(reply.response.headers().get("location"), Some("/docs?page=2"));
        assert_eq!(pres.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trailing_slash_is_significant_without_strict_slash() {
        let d = App::new(ServerConfig::default())
            .route(write_route("/docs", "docs"))
            .build()
            .unwrap();
        let reply = d.dispatch(get("/docs/")).await;
        assert_eq!(reply.response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn method_filter_falls_through_to_catch_all() {
        let d = App::new(ServerConfig::default())
            .route(write_route("/form", "posted").methods([crate::Method::Post]))
            .build()
            .unwrap();
        assert_eq!(d.dispatch(get("/form")).await.response.status(), StatusCode::NOT_FOUND);
        let reply = d.dispatch(request("POST /form HTTP/1.1\r\n\r\n")).await;
        assert_eq!(reply.response.text(), "posted");
    }

    #[tokio::test]
    async fn websocket_upgrade_is_handed_back() {
        let d = App::new(ServerConfig::default())
            .route(Route::new("/ws", |ctx| {
                Box::pin(async move {
                    if ctx.upgrade_websocket(|_conn| async {}).is_err() {
                        ctx.set_response_code(StatusCode::BAD_REQUEST);
                    }
                })
            }))
            .build()
            .unwrap();

        let reply = d
            .dispatch(request(
                "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            ))
            .await;
        assert_eq!(reply.response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(reply.upgrade.is_some());

        let reply = d.dispatch(get("/ws")).await;
        assert_eq!(reply.response.status(), StatusCode::BAD_REQUEST);
        assert!(reply.upgrade.is_none());
    }
}
