//! Template body loading.
//!
//! A [`TemplateBody`] is the executable unit behind a template name: it emits
//! text and drives the block protocol on the [`Template`] it runs against.
//! A [`TemplateLoader`] turns a resolved path into such a body.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::script::Script;
use crate::template::Template;

/// An executable template body.
pub trait TemplateBody: Send + Sync {
    /// Run the body against `template`.
    fn execute(&self, template: &mut Template) -> TemplateResult<()>;
}

impl<F> TemplateBody for F
where
    F: Fn(&mut Template) -> TemplateResult<()> + Send + Sync,
{
    fn execute(&self, template: &mut Template) -> TemplateResult<()> {
        self(template)
    }
}

/// Resolves template paths to bodies.
pub trait TemplateLoader: Send + Sync {
    /// Load the body stored at `path`.
    ///
    /// Fails with [`TemplateError::NotFound`] if nothing is stored there.
    fn load(&self, path: &Path) -> TemplateResult<Arc<dyn TemplateBody>>;
}

/// Loads script bodies from the file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl FileLoader {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateLoader for FileLoader {
    fn load(&self, path: &Path) -> TemplateResult<Arc<dyn TemplateBody>> {
        if !path.is_file() {
            return Err(TemplateError::NotFound(format!(
                "Could not render. The file {:?} could not be found",
                path
            )));
        }

        debug!("Loading template script from {:?}", path);
        let source = fs::read_to_string(path)?;
        let script = Script::parse(path, &source)?;
        Ok(Arc::new(script))
    }
}

/// Keeps bodies in memory, keyed by resolved path.
///
/// Records how often each path was loaded so tests can verify caching.
#[derive(Default)]
pub struct MemoryLoader {
    bodies: RwLock<HashMap<PathBuf, Arc<dyn TemplateBody>>>,
    loads: AtomicUsize,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure body under `path`, replacing any previous body.
    pub fn insert<F>(&self, path: impl Into<PathBuf>, body: F)
    where
        F: Fn(&mut Template) -> TemplateResult<()> + Send + Sync + 'static,
    {
        self.insert_body(path, Arc::new(body));
    }

    /// Builder form of [`MemoryLoader::insert`].
    pub fn with_body<F>(self, path: impl Into<PathBuf>, body: F) -> Self
    where
        F: Fn(&mut Template) -> TemplateResult<()> + Send + Sync + 'static,
    {
        self.insert(path, body);
        self
    }

    /// Register any body under `path`.
    pub fn insert_body(&self, path: impl Into<PathBuf>, body: Arc<dyn TemplateBody>) {
        let path = path.into();
        debug!("Registering in-memory template at {:?}", path);
        self.bodies.write().insert(path, body);
    }

    /// Parse `source` as a script and register it under `path`.
    pub fn insert_script(&self, path: impl Into<PathBuf>, source: &str) -> TemplateResult<()> {
        let path = path.into();
        let script = Script::parse(&path, source)?;
        self.insert_body(path, Arc::new(script));
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.bodies.read().contains_key(path)
    }

    /// Number of successful loads so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl TemplateLoader for MemoryLoader {
    fn load(&self, path: &Path) -> TemplateResult<Arc<dyn TemplateBody>> {
        let body = self
            .bodies
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(format!("{:?}", path)))?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(body)
    }
}

impl std::fmt::Debug for MemoryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLoader")
            .field("bodies", &self.bodies.read().keys().collect::<Vec<_>>())
            .field("loads", &self.load_count())
            .finish()
    }
}

impl<L: TemplateLoader + ?Sized> TemplateLoader for Arc<L> {
    fn load(&self, path: &Path) -> TemplateResult<Arc<dyn TemplateBody>> {
        (**self).load(path)
    }
}
