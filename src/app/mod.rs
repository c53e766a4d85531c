//! Application assembly.
//!
//! [`App`] collects configuration, routes, hooks and the pluggable
//! collaborators, then freezes them into a [`Dispatcher`] and hands it to
//! the listener. Nothing registered here can change after [`App::run`].

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::dispatch::Dispatcher;
use crate::middleware::Hooks;
use crate::router::{Route, RouteTable};
use crate::security::{HmacTokens, TokenService};
use crate::server::{Server, ServerError};
use crate::static_files::StaticResolver;
use crate::template::{FsTemplates, TemplateRenderer};

/// Read-only state shared by every request.
pub struct AppState {
    pub config: ServerConfig,
    /// Session cookie name, with the configured prefix applied.
    pub cookie_name: String,
    pub tokens: Arc<dyn TokenService>,
    /// `None` when templates are disabled.
    pub templates: Option<Arc<dyn TemplateRenderer>>,
    pub hooks: Hooks,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("cookie_name", &self.cookie_name)
            .field("templates", &self.templates.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// Application builder.
///
/// # Examples
///
/// ```rust,no_run
/// use porch::{App, Route, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     App::new(ServerConfig::default())
///         .route(Route::new("/hello/{name}", |ctx| Box::pin(async move {
///             let name = ctx.param("name").unwrap_or("world").to_owned();
///             ctx.write(format!("Hello, {name}!"));
///         })))
///         .run()
///         .await?;
///     Ok(())
/// }
/// ```
pub struct App {
    config: ServerConfig,
    routes: Vec<Route>,
    hooks: Hooks,
    tokens: Arc<dyn TokenService>,
    templates: Option<Arc<dyn TemplateRenderer>>,
}

impl App {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            hooks: Hooks::default(),
            tokens: Arc::new(HmacTokens),
            templates: None,
        }
    }

    /// Appends a route. Routes are matched in registration order.
    #[must_use]
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    #[must_use]
    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.routes.extend(routes);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replaces the session identifier service.
    #[must_use]
    pub fn token_service(mut self, tokens: impl TokenService + 'static) -> Self {
        self.tokens = Arc::new(tokens);
        self
    }

    /// Replaces the directory-backed renderer. A custom renderer enables
    /// templates even without `templates_dir`.
    #[must_use]
    pub fn template_renderer(mut self, renderer: impl TemplateRenderer + 'static) -> Self {
        self.templates = Some(Arc::new(renderer));
        self
    }

    /// Freezes everything except the routes into shared state.
    pub fn into_state(self) -> Arc<AppState> {
        self.split().0
    }

    /// Validates the configuration and builds the request dispatcher.
    ///
    /// Configured directories that do not exist are logged and disabled.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        self.config.validate()?;

        let statics = match &self.config.static_files_dir {
            Some(dir) if dir.is_dir() => {
                info!(dir = %dir.display(), "static files directory");
                Some(StaticResolver::new(dir, &self.config.effective_extensions()))
            }
            Some(dir) => {
                warn!(dir = %dir.display(), "static files directory missing, static serving disabled");
                None
            }
            None => None,
        };

        let (state, routes) = self.split();
        Ok(Dispatcher::new(state, RouteTable::new(routes), statics))
    }

    /// Builds the dispatcher, binds `host:port` and serves until the
    /// listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr();
        let dispatcher = Arc::new(self.build()?);
        let server = Server::bind(&addr).await?;
        server.run(dispatcher).await
    }

    fn split(self) -> (Arc<AppState>, Vec<Route>) {
        let templates = self.templates.or_else(|| match &self.config.templates_dir {
            Some(dir) if dir.is_dir() => {
                info!(dir = %dir.display(), "templates directory");
                Some(Arc::new(FsTemplates::new(dir)) as Arc<dyn TemplateRenderer>)
            }
            Some(dir) => {
                warn!(dir = %dir.display(), "templates directory missing, templates disabled");
                None
            }
            None => None,
        });

        let state = AppState {
            cookie_name: self.config.cookie_name(),
            config: self.config,
            tokens: self.tokens,
            templates,
            hooks: self.hooks,
        };
        (Arc::new(state), self.routes)
    }
}
