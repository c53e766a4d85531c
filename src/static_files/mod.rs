//! Static file serving for the catch-all path.
//!
//! [`StaticResolver`] decides from the request path alone whether a request
//! is a static asset. The allow-list is compiled into an extension table
//! once; resolving looks up every dotted suffix of the last path segment
//! (`app.min.js` → `min.js`, `js`) and the entry listed first wins.
//! Extensions match case-sensitively. A `*` entry matches every path at its
//! own list position.
//!
//! CSS and JS requests may carry a numeric cache-busting suffix,
//! `/app-1699999999.js`, which is stripped before the file is looked up.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::StatusCode;
use crate::context::ResponseContext;

const WILDCARD: &str = "*";

/// Extensions that get cache-bust rewriting.
const CACHE_BUSTED: [&str; 2] = ["css", "js"];

#[derive(Debug, Clone, Copy)]
struct Entry {
    position: usize,
    cache_bust: bool,
}

/// Maps request paths to files below a root directory.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    root: PathBuf,
    table: HashMap<String, Entry>,
    wildcard: Option<usize>,
}

impl StaticResolver {
    /// Builds the lookup table from an ordered extension list. Earlier
    /// entries win; duplicates keep their first position.
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        let mut table = HashMap::with_capacity(extensions.len());
        let mut wildcard = None;
        for (position, ext) in extensions.iter().enumerate() {
            if ext == WILDCARD {
                wildcard.get_or_insert(position);
                continue;
            }
            let cache_bust = CACHE_BUSTED.contains(&ext.as_str());
            table.entry(ext.clone()).or_insert(Entry {
                position,
                cache_bust,
            });
        }
        Self {
            root: root.into(),
            table,
            wildcard,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path to serve for `path`, after cache-bust rewriting, or
    /// `None` if the path is not a static asset.
    pub fn resolve(&self, path: &str) -> Option<String> {
        let last = path.rsplit('/').next().unwrap_or_default();

        let best = last
            .match_indices('.')
            .filter_map(|(i, _)| {
                let ext = &last[i + 1..];
                self.table.get(ext).map(|entry| (ext, *entry))
            })
            .min_by_key(|(_, entry)| entry.position);

        match (best, self.wildcard) {
            (Some((_, entry)), Some(w)) if w < entry.position => Some(path.to_owned()),
            (Some((ext, entry)), _) if entry.cache_bust => Some(strip_cache_bust(path, ext)),
            (Some(_), _) | (None, Some(_)) => Some(path.to_owned()),
            (None, None) => None,
        }
    }

    /// Serves the asset for the request path if it is one. Returns `false`
    /// without touching the response when the path is not a static asset.
    pub async fn try_serve(&self, ctx: &mut ResponseContext) -> bool {
        let Some(rewritten) = self.resolve(ctx.request().path()) else {
            return false;
        };
        self.serve(ctx, &rewritten).await;
        true
    }

    /// Writes the file at `path` (relative to the root) into the response.
    ///
    /// `..` segments are refused with `400`; missing files and directories
    /// get `404`.
    pub async fn serve(&self, ctx: &mut ResponseContext, path: &str) {
        let Some(file) = self.file_path(path) else {
            debug!(path, "refusing static path");
            ctx.set_response_code(StatusCode::BAD_REQUEST);
            ctx.set_header("Content-Type", "text/plain; charset=utf-8");
            ctx.write("invalid URL path");
            return;
        };

        let is_file = tokio::fs::metadata(&file)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            not_found(ctx);
            return;
        }

        match tokio::fs::read(&file).await {
            Ok(bytes) => {
                debug!(file = %file.display(), size = bytes.len(), "serving static file");
                ctx.set_response_code(StatusCode::OK);
                ctx.set_header("Content-Type", content_type(&file));
                ctx.write_bytes(&bytes);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => not_found(ctx),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!(file = %file.display(), error = %e, "static file not readable");
                ctx.set_response_code(StatusCode::FORBIDDEN);
                ctx.write("403 Forbidden");
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "static file read failed");
                ctx.set_response_code(StatusCode::INTERNAL_SERVER_ERROR);
                ctx.write("500 Internal Server Error");
            }
        }
    }

    // Joins a decoded request path onto the root, refusing `..`.
    fn file_path(&self, path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        let mut file = self.root.clone();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return None,
                s if s.contains('\\') || s.contains('\0') => return None,
                s => file.push(s),
            }
        }
        Some(file)
    }
}

fn not_found(ctx: &mut ResponseContext) {
    ctx.set_response_code(StatusCode::NOT_FOUND);
    ctx.set_header("Content-Type", "text/plain; charset=utf-8");
    ctx.write("404 page not found");
}

// `/css/site-123.css` → `/css/site.css`; other paths are returned unchanged.
fn strip_cache_bust(path: &str, ext: &str) -> String {
    let rewritten = path
        .strip_suffix(ext)
        .and_then(|p| p.strip_suffix('.'))
        .and_then(|p| p.rsplit_once('-'))
        .filter(|(_, digits)| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .map(|(stem, _)| format!("{stem}.{ext}"));
    rewritten.unwrap_or_else(|| path.to_owned())
}

/// Content type for a file, from its extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "json" | "map" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::config::{DEFAULT_ALLOWED_EXTENSIONS, ServerConfig};
    use crate::http::Request;
    use std::fs;

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    fn defaults(root: &Path) -> StaticResolver {
        StaticResolver::new(root, &exts(&DEFAULT_ALLOWED_EXTENSIONS))
    }

    fn ctx(path: &str) -> ResponseContext {
        let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        ResponseContext::new(req, App::new(ServerConfig::default()).into_state())
    }

    #[test]
    fn default_list_resolution() {
        let r = defaults(Path::new("/srv"));
        assert_eq!(r.resolve("/img/logo.png").as_deref(), Some("/img/logo.png"));
        assert_eq!(r.resolve("/img/LOGO.PNG"), None);
        assert_eq!(r.resolve("/about"), None);
        assert_eq!(r.resolve("/page.html"), None);
        assert_eq!(r.resolve("/dir.css/page"), None);
    }

    #[test]
    fn cache_bust_only_for_css_and_js() {
        let r = defaults(Path::new("/srv"));
        assert_eq!(r.resolve("/app-1234.js").as_deref(), Some("/app.js"));
        assert_eq!(r.resolve("/css/site-1.css").as_deref(), Some("/css/site.css"));
        assert_eq!(r.resolve("/app-v2.js").as_deref(), Some("/app-v2.js"));
        assert_eq!(r.resolve("/logo-123.png").as_deref(), Some("/logo-123.png"));
    }

    #[test]
    fn extensions_are_case_sensitive() {
        let r = defaults(Path::new("/srv"));
        assert_eq!(r.resolve("/APP-42.JS"), None);

        let r = StaticResolver::new("/srv", &exts(&["JS", "js"]));
        assert_eq!(r.resolve("/APP-42.JS").as_deref(), Some("/APP-42.JS"));
        assert_eq!(r.resolve("/app-42.js").as_deref(), Some("/app.js"));
    }

    #[test]
    fn earliest_extension_wins() {
        let r = StaticResolver::new("/srv", &exts(&["gz", "tar.gz"]));
        assert!(r.resolve("/a.tar.gz").is_some());

        // `*` listed before `js` disables js cache-busting.
        let r = StaticResolver::new("/srv", &exts(&["*", "js"]));
        assert_eq!(r.resolve("/app-1.js").as_deref(), Some("/app-1.js"));
        assert_eq!(r.resolve("/anything").as_deref(), Some("/anything"));

        let r = StaticResolver::new("/srv", &exts(&["js", "*"]));
        assert_eq!(r.resolve("/app-1.js").as_deref(), Some("/app.js"));
    }

    #[test]
    fn parent_segments_are_refused() {
        let r = defaults(Path::new("/srv"));
        assert!(r.file_path("/../etc/passwd.png").is_none());
        assert!(r.file_path("/a/%2e%2e/b.png").is_none());
        assert_eq!(r.file_path("/a/./b.png").unwrap(), Path::new("/srv/a/b.png"));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a.css")), "text/css; charset=utf-8");
        assert_eq!(content_type(Path::new("a.PNG")), "image/png");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(content_type(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn serves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        let r = defaults(dir.path());

        let mut ctx = ctx("/css/site-42.css");
        assert!(r.try_serve(&mut ctx).await);
        assert_eq!(ctx.response().status(), StatusCode::OK);
        assert_eq!(ctx.response().text(), "body{}");
        assert_eq!(
            ctx.response().headers().get("content-type"),
            Some("text/css; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn missing_file_and_directory_are_404() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("folder.png")).unwrap();
        let r = defaults(dir.path());

        let mut missing = ctx("/missing.png");
        assert!(r.try_serve(&mut missing).await);
        assert_eq!(missing.response().status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.response().text(), "404 page not found");

        let mut folder = ctx("/folder.png");
        assert!(r.try_serve(&mut folder).await);
        assert_eq!(folder.response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let r = defaults(dir.path());
        let mut ctx = ctx("/../secret.png");
        assert!(r.try_serve(&mut ctx).await);
        assert_eq!(ctx.response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_assets_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let r = defaults(dir.path());
        let mut ctx = ctx("/about");
        assert!(!r.try_serve(&mut ctx).await);
        assert!(!ctx.response_code_set());
    }
}
