//! A small guestbook showing sessions, CSRF-protected forms, hooks and a
//! WebSocket echo endpoint.
//!
//! ```text
//! cargo run --example app            # defaults, port 8080
//! cargo run --example app -- app.toml
//! ```

use porch::{App, Hooks, Route, ServerConfig, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "porch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig {
            use_sessions: true,
            session_key: "demo-only-secret".into(),
            insecure_cookie: true,
            ..ServerConfig::default()
        },
    };

    let hooks = Hooks::new()
        .pre(|ctx| {
            Box::pin(async move {
                ctx.helper.insert("SiteName".into(), "Guestbook".into());
            })
        })
        .post(|ctx| {
            Box::pin(async move {
                ctx.set_header("X-Served-By", "porch");
            })
        })
        .not_found(|ctx| {
            Box::pin(async move {
                ctx.set_response_code(StatusCode::NOT_FOUND);
                ctx.write("Nothing to see here.\n");
            })
        });

    App::new(config)
        .hooks(hooks)
        .route(Route::new("/", |ctx| {
            Box::pin(async move {
                let token = ctx.csrf_token();
                ctx.set_header("Content-Type", "text/html; charset=utf-8");
                ctx.write(format!(
                    "<form method=post action=/post>\
                     <input type=hidden name=csrf_token value=\"{token}\">\
                     <input name=message><button>Sign</button></form>"
                ));
            })
        }))
        .route(
            Route::new("/post", |ctx| {
                Box::pin(async move {
                    let message = ctx
                        .request()
                        .request()
                        .form()
                        .and_then(|mut form| form.remove("message"))
                        .unwrap_or_default();
                    tracing::info!(%message, "guestbook entry");
                    ctx.set_redirect("/");
                })
            })
            .name("sign")
            .methods([porch::Method::Post])
            .csrf_protect(true),
        )
        .route(Route::new("/hello/{name}", |ctx| {
            Box::pin(async move {
                let name = ctx.param("name").unwrap_or("stranger").to_owned();
                if let Err(e) = ctx.json(&serde_json::json!({ "hello": name })) {
                    tracing::warn!(error = %e, "could not encode greeting");
                }
            })
        }))
        .route(Route::new("/echo", |ctx| {
            Box::pin(async move {
                let accepted = ctx.upgrade_websocket(|mut conn| async move {
                    // Raw bytes back to the sender; framing is left to the client.
                    let mut buf = vec![0u8; 1024];
                    if !conn.buffered.is_empty() && conn.stream.write_all(&conn.buffered).await.is_err() {
                        return;
                    }
                    while let Ok(n) = conn.stream.read(&mut buf).await {
                        if n == 0 || conn.stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
                if let Err(e) = accepted {
                    ctx.set_response_code(StatusCode::BAD_REQUEST);
                    ctx.write(e.to_string());
                }
            })
        }))
        .run()
        .await?;

    Ok(())
}
