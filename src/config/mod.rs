//! Server configuration.
//!
//! [`ServerConfig`] holds every plain-data setting of an application. It
//! can be built in code or loaded from TOML; hooks and routes are supplied
//! separately through [`App`](crate::app::App) because they are code.
//!
//! ```toml
//! port = 8080
//! static_files_dir = "./public"
//! templates_dir = "./templates"
//! use_sessions = true
//! use_auto_render = true
//! session_key = "change-me"
//! cookie_prefix = "shop"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Extensions served from the static directory when none are configured.
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 6] = ["js", "css", "jpg", "png", "ico", "gif"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("sessions are enabled but session_key is empty")]
    MissingSessionKey,

    #[error("invalid static file extension {0:?}")]
    InvalidExtension(String),
}

/// Process-wide settings, immutable once the server starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    pub port: u16,
    /// Directory static assets are served from. `None` disables static serving.
    pub static_files_dir: Option<PathBuf>,
    /// Directory templates are loaded from. `None` disables templates.
    pub templates_dir: Option<PathBuf>,
    /// Extensions served from `static_files_dir`, without the dot. `"*"`
    /// matches any path. Empty means [`DEFAULT_ALLOWED_EXTENSIONS`].
    pub allowed_extensions: Vec<String>,
    pub use_sessions: bool,
    /// Render `<path>.html` for requests no route handles.
    pub use_auto_render: bool,
    /// Redirect `/a/` to `/a` (and back) when only the other form is routed.
    pub strict_slash: bool,
    pub session_key: String,
    pub cookie_prefix: String,
    /// Omit the `Secure` attribute from the session cookie, for plain-HTTP
    /// development setups.
    pub insecure_cookie: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            static_files_dir: None,
            templates_dir: None,
            allowed_extensions: Vec::new(),
            use_sessions: false,
            use_auto_render: false,
            strict_slash: false,
            session_key: String::new(),
            cookie_prefix: String::new(),
            insecure_cookie: false,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks settings that would otherwise fail per request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_sessions && self.session_key.is_empty() {
            return Err(ConfigError::MissingSessionKey);
        }
        for ext in &self.allowed_extensions {
            let bad = ext.is_empty() || ext.starts_with('.') || ext.contains('/');
            if bad {
                return Err(ConfigError::InvalidExtension(ext.clone()));
            }
        }
        Ok(())
    }

    /// Returns the configured extensions, or the defaults when none are set.
    pub fn effective_extensions(&self) -> Vec<String> {
        if self.allowed_extensions.is_empty() {
            DEFAULT_ALLOWED_EXTENSIONS.iter().map(|e| (*e).to_owned()).collect()
        } else {
            self.allowed_extensions.clone()
        }
    }

    /// Returns the session cookie name, honoring `cookie_prefix`.
    pub fn cookie_name(&self) -> String {
        crate::security::cookie_name(&self.cookie_prefix)
    }

    /// Returns `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.bind_addr(), "0.0.0.0:8080");
        assert_eq!(c.cookie_name(), "session_id");
        assert_eq!(c.effective_extensions(), DEFAULT_ALLOWED_EXTENSIONS);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let c = ServerConfig::from_toml_str(
            r#"
            port = 9000
            use_sessions = true
            session_key = "k"
            cookie_prefix = "shop"
            allowed_extensions = ["svg", "*"]
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.cookie_name(), "shop_session_id");
        assert_eq!(c.effective_extensions(), vec!["svg", "*"]);
    }

    #[test]
    fn sessions_need_a_key() {
        let err = ServerConfig::from_toml_str("use_sessions = true").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSessionKey));
    }

    #[test]
    fn dotted_extensions_are_rejected() {
        let err = ServerConfig::from_toml_str(r#"allowed_extensions = [".css"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExtension(e) if e == ".css"));
    }

    #[test]
    fn syntax_errors_surface_as_parse() {
        let err = ServerConfig::from_toml_str("port = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ServerConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
