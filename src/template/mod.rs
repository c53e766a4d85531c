//! Template rendering.
//!
//! [`TemplateRenderer`] is the seam the dispatcher renders through; the
//! default [`FsTemplates`] loads Jinja-style templates from a directory
//! with `minijinja`, auto-escaping `.html` files.

use std::fmt;
use std::path::{Path, PathBuf};

use minijinja::{Environment, ErrorKind};
use thiserror::Error;
use tracing::debug;

use crate::context::Helper;

/// Rendered when the template named after the request is missing.
pub const FALLBACK_TEMPLATE: &str = "404.html";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no template found among {candidates:?}")]
    NotFound { candidates: Vec<String> },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("no template directory configured")]
    Unconfigured,

    #[error("render task aborted: {0}")]
    Aborted(String),
}

/// Renders the first template of `candidates` that exists.
///
/// Implementations are called from a blocking task and may do file I/O.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, candidates: &[String], data: &Helper) -> Result<String, RenderError>;
}

/// Templates loaded lazily from a directory.
pub struct FsTemplates {
    root: PathBuf,
    env: Environment<'static>,
}

impl FsTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut env = Environment::new();
        env.set_loader(minijinja::path_loader(root.clone()));
        Self { root, env }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl fmt::Debug for FsTemplates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsTemplates")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl TemplateRenderer for FsTemplates {
    fn render(&self, candidates: &[String], data: &Helper) -> Result<String, RenderError> {
        for name in candidates {
            if name.split('/').any(|seg| seg == "..") {
                debug!(template = %name, "skipping template name outside the root");
                continue;
            }
            match self.env.get_template(name) {
                Ok(template) => return Ok(template.render(data)?),
                Err(e) if e.kind() == ErrorKind::TemplateNotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RenderError::NotFound {
            candidates: candidates.to_vec(),
        })
    }
}
