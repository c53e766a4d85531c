//! Request routing: map URL patterns to handlers with access-control flags.
//!
//! A [`RouteTable`] is built once from an ordered list of [`Route`]s and is
//! read-only afterwards. Three pattern styles are supported:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/{id}`        | `/users/42`                | `id → "42"`                     |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"` |
//!
//! Trailing slashes are significant: `/users/` and `/users` are different
//! paths. With strict-slash routing the table redirects one to the other
//! when only one of them is registered.
//!
//! Routes are matched in registration order; the first route whose pattern
//! (and method filter, if any) matches wins.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use crate::Method;
use crate::context::{PathParams, ResponseContext};

/// A boxed, `Send` future borrowing from `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased async handler operating on a borrowed [`ResponseContext`].
///
/// Closures are written as `|ctx| Box::pin(async move { ... })`; the boxed
/// future may hold the `&mut` borrow across `.await` points.
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, ()> + Send + Sync + 'static>;

/// Above this many routes registration logs one summary line instead of
/// one line per pattern.
const VERBOSE_REGISTRATION_LIMIT: usize = 10;

// A single path segment, either a literal string or a named capture.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    // Fixed number of segments, some of which may be captures.
    Segments {
        segments: Vec<Segment>,
        trailing_slash: bool,
    },
    // Any path equal to the prefix or below it, e.g. `/files/*`.
    Wildcard(String),
}

// Splits `/a/b/` into (["a", "b"], true). The root path has no segments.
fn split_path(path: &str) -> (Vec<&str>, bool) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return (Vec::new(), false);
    }
    match trimmed.strip_suffix('/') {
        Some(inner) => (inner.split('/').collect(), true),
        None => (trimmed.split('/').collect(), false),
    }
}

impl Pattern {
    /// Parse a route pattern string into a `Pattern`.
    ///
    /// A pattern ending in `/*` becomes a wildcard over its prefix. Any
    /// other pattern is split into segments, where `{name}` and `:name`
    /// segments capture and everything else must match literally.
    fn parse(pattern: &str) -> Self {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_owned());
        }

        let (raw, trailing_slash) = split_path(pattern);
        let segments = raw
            .into_iter()
            .map(|s| {
                let capture = s
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .or_else(|| s.strip_prefix(':'));
                match capture {
                    Some(name) if !name.is_empty() => Segment::Parameter(name.to_owned()),
                    _ => Segment::Static(s.to_owned()),
                }
            })
            .collect();

        Pattern::Segments {
            segments,
            trailing_slash,
        }
    }

    // Try to match `path` against this pattern, returning extracted [`PathParams`] on success.
    fn matches(&self, path: &str) -> Option<PathParams> {
        match self {
            Pattern::Segments {
                segments,
                trailing_slash,
            } => {
                let (path_segments, path_trailing) = split_path(path);
                if segments.len() != path_segments.len() || *trailing_slash != path_trailing {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s == path_seg => {}
                        Segment::Static(_) => return None,
                        Segment::Parameter(_) if path_seg.is_empty() => return None,
                        Segment::Parameter(name) => params.insert(name.clone(), path_seg),
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => {
                let suffix = path.strip_prefix(prefix.as_str())?;
                if !suffix.is_empty() && !suffix.starts_with('/') {
                    return None;
                }
                let mut params = PathParams::new();
                params.insert("wildcard", suffix);
                Some(params)
            }
        }
    }
}

/// A path pattern bound to a handler plus access-control flags.
///
/// # Examples
///
/// ```rust,no_run
/// use porch::router::Route;
/// use porch::Method;
///
/// let route = Route::new("/posts/{id}", |ctx| Box::pin(async move {
///     let id = ctx.param("id").unwrap_or("").to_owned();
///     ctx.write(id);
/// }))
/// .name("post")
/// .methods([Method::Post])
/// .csrf_protect(true)
/// .needs_login(true);
/// ```
pub struct Route {
    pattern: String,
    compiled: Pattern,
    name: String,
    csrf_protect: bool,
    needs_login: bool,
    methods: Vec<Method>,
    handler: Handler,
}

impl Route {
    pub fn new<F>(pattern: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut ResponseContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        Self {
            compiled: Pattern::parse(&pattern),
            pattern,
            name: String::new(),
            csrf_protect: false,
            needs_login: false,
            methods: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reject requests without the session's CSRF token with `403`.
    #[must_use]
    pub fn csrf_protect(mut self, on: bool) -> Self {
        self.csrf_protect = on;
        self
    }

    /// Run the login check hook before the handler.
    #[must_use]
    pub fn needs_login(mut self, on: bool) -> Self {
        self.needs_login = on;
        self
    }

    /// Restrict the route to the given methods. No methods means any method.
    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn route_name(&self) -> &str {
        &self.name
    }

    pub fn is_csrf_protected(&self) -> bool {
        self.csrf_protect
    }

    pub fn is_login_required(&self) -> bool {
        self.needs_login
    }

    /// Invokes the handler.
    pub async fn call(&self, ctx: &mut ResponseContext) {
        (self.handler)(ctx).await
    }

    fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    // Returns `Some(params)` when both the method filter and path pattern match.
    fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        if self.allows(method) {
            self.compiled.matches(path)
        } else {
            None
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("name", &self.name)
            .field("csrf_protect", &self.csrf_protect)
            .field("needs_login", &self.needs_login)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving a request path against a [`RouteTable`].
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Found {
        route: &'a Route,
        params: PathParams,
    },
    /// Strict-slash redirect target, query string included.
    Redirect(String),
    /// No route; the request takes the catch-all path.
    CatchAll,
}

/// Immutable, ordered route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Compiles `routes`, keeping their order.
    pub fn new(routes: Vec<Route>) -> Self {
        if routes.len() > VERBOSE_REGISTRATION_LIMIT {
            info!(count = routes.len(), "adding patterns to router");
        } else {
            for route in &routes {
                info!(pattern = %route.pattern, name = %route.name, "adding pattern to router");
            }
        }
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Returns the first route matching `method` and `path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<(&Route, PathParams)> {
        self.routes
            .iter()
            .find_map(|route| route.matches(method, path).map(|params| (route, params)))
    }

    /// Resolves a request, applying strict-slash redirection when enabled.
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        strict_slash: bool,
    ) -> RouteMatch<'_> {
        if let Some((route, params)) = self.find(method, path) {
            return RouteMatch::Found { route, params };
        }

        if strict_slash && path != "/" {
            let toggled = match path.strip_suffix('/') {
                Some(stripped) => stripped.to_owned(),
                None => format!("{path}/"),
            };
            if self.find(method, &toggled).is_some() {
                let location = match query {
                    Some(q) => format!("{toggled}?{q}"),
                    None => toggled,
                };
                return RouteMatch::Redirect(location);
            }
        }

        RouteMatch::CatchAll
    }
}
