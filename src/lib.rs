//! # porch
//!
//! A small async HTTP/1.1 application toolkit: ordered routing, signed
//! cookie sessions, CSRF protection, static files and template rendering,
//! tied together by a fixed request pipeline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use porch::{App, Route, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 8080,
//!         use_sessions: true,
//!         session_key: "change-me".into(),
//!         ..ServerConfig::default()
//!     };
//!
//!     App::new(config)
//!         .route(Route::new("/", |ctx| Box::pin(async move {
//!             ctx.write("Hello, World!");
//!         })))
//!         .route(
//!             Route::new("/post", |ctx| Box::pin(async move {
//!                 ctx.write("accepted");
//!             }))
//!             .csrf_protect(true),
//!         )
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

// ── Transport ────────────────────────────────────────────────────────────────
pub mod http;
pub mod server;

// ── Request pipeline ─────────────────────────────────────────────────────────
pub mod app;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod middleware;
pub mod router;

// ── Collaborators ────────────────────────────────────────────────────────────
pub mod realtime;
pub mod security;
pub mod static_files;
pub mod template;

// ── Convenience re-exports ───────────────────────────────────────────────────
pub use app::App;
pub use config::ServerConfig;
pub use context::{Helper, ResponseContext};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::Hooks;
pub use router::Route;
pub use server::{Server, ServerError};
