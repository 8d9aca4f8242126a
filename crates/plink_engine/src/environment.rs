//! The rendering environment.
//!
//! An [`Environment`] is a factory for [`Template`]s. It is associated with a
//! template directory and extension so templates can be named rather than
//! located, and it holds variables shared by every template it creates. This
//! is where helpers (site name, base URLs, filters) live.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::block::escape;
use crate::config::EnvironmentConfig;
use crate::error::{TemplateError, TemplateResult};
use crate::loader::{FileLoader, TemplateLoader};
use crate::template::Template;

/// Variables bound to a render or shared through an environment.
pub type Variables = HashMap<String, Value>;

/// A content transform applied when a block closes.
pub type Filter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Filters every environment starts with.
pub(crate) fn builtin_filter(name: &str) -> Option<Filter> {
    match name {
        "h" | "escape" => Some(Arc::new(|s: &str| escape(s))),
        "trim" => Some(Arc::new(|s: &str| s.trim().to_string())),
        _ => None,
    }
}

pub(crate) struct EnvironmentInner {
    config: RwLock<EnvironmentConfig>,
    variables: RwLock<Variables>,
    filters: RwLock<HashMap<String, Filter>>,
    templates: Mutex<HashMap<String, Arc<Mutex<Template>>>>,
    loader: Arc<dyn TemplateLoader>,
}

/// Template factory and shared-variable store.
///
/// Cloning an environment is cheap; clones share the same cache, variables
/// and configuration.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    /// Create an environment loading scripts from `template_dir`.
    pub fn new(template_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self::from_config(EnvironmentConfig::new(template_dir).with_extension(extension))
    }

    pub fn from_config(config: EnvironmentConfig) -> Self {
        Self::with_loader(config, FileLoader::new())
    }

    /// Create an environment backed by a custom loader.
    pub fn with_loader(config: EnvironmentConfig, loader: impl TemplateLoader + 'static) -> Self {
        let filters = ["h", "escape", "trim"]
            .into_iter()
            .filter_map(|name| builtin_filter(name).map(|f| (name.to_string(), f)))
            .collect();

        Self {
            inner: Arc::new(EnvironmentInner {
                config: RwLock::new(config),
                variables: RwLock::new(Variables::new()),
                filters: RwLock::new(filters),
                templates: Mutex::new(HashMap::new()),
                loader: Arc::new(loader),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EnvironmentInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<EnvironmentInner> {
        &self.inner
    }

    pub(crate) fn loader(&self) -> Arc<dyn TemplateLoader> {
        Arc::clone(&self.inner.loader)
    }

    /// Render the template called `name`.
    ///
    /// The template object is created on first use and reused afterwards. If
    /// the cached template is already rendering (another thread, or a body
    /// rendering its own name), a fresh uncached template is used instead.
    pub fn render(&self, name: &str, variables: Variables) -> TemplateResult<String> {
        let cached = {
            let mut templates = self.inner.templates.lock();
            Arc::clone(templates.entry(name.to_string()).or_insert_with(|| {
                debug!("Creating template {}", name);
                Arc::new(Mutex::new(Template::with_environment(self, Some(name))))
            }))
        };

        let output = match cached.try_lock() {
            Some(mut template) => template.render(variables)?,
            None => {
                debug!("Template {} is busy, rendering a fresh instance", name);
                Template::with_environment(self, Some(name)).render(variables)?
            }
        };

        info!("Rendered template {} ({} bytes)", name, output.len());
        Ok(output)
    }

    /// Create an empty template in this environment, to be built
    /// programmatically.
    pub fn template(&self) -> Template {
        Template::with_environment(self, None)
    }

    /// Create an uncached template bound to `name`.
    pub fn load(&self, name: &str) -> Template {
        Template::with_environment(self, Some(name))
    }

    /// The cached template for `name`, if it has been rendered before.
    pub fn cached_template(&self, name: &str) -> Option<Arc<Mutex<Template>>> {
        self.inner.templates.lock().get(name).cloned()
    }

    pub fn clear_cache(&self) {
        debug!("Clearing template cache");
        self.inner.templates.lock().clear();
    }

    /// Path a template name resolves to. Performs no I/O.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        self.inner.config.read().resolve_path(name)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Snapshot of the current configuration.
    pub fn config(&self) -> EnvironmentConfig {
        self.inner.config.read().clone()
    }

    pub fn template_dir(&self) -> PathBuf {
        self.inner.config.read().template_dir.clone()
    }

    pub fn set_template_dir(&self, template_dir: impl Into<PathBuf>) {
        self.inner.config.write().template_dir = template_dir.into();
    }

    pub fn extension(&self) -> String {
        self.inner.config.read().extension.clone()
    }

    pub fn set_extension(&self, extension: impl Into<String>) {
        self.inner.config.write().extension = extension.into();
    }

    // ------------------------------------------------------------------
    // Shared variables
    // ------------------------------------------------------------------

    /// Read a shared variable. Absent names are [`TemplateError::NotFound`].
    pub fn get(&self, name: &str) -> TemplateResult<Value> {
        self.get_opt(name)
            .ok_or_else(|| TemplateError::NotFound(format!("variable {}", name)))
    }

    pub fn get_opt(&self, name: &str) -> Option<Value> {
        self.inner.variables.read().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.inner
            .variables
            .write()
            .insert(name.to_string(), value.into());
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.variables.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.inner.variables.write().remove(name)
    }

    /// Snapshot of all shared variables.
    pub fn variables(&self) -> Variables {
        self.inner.variables.read().clone()
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Register a filter usable as `{% endblock name %}` in scripts.
    pub fn register_filter<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering filter {}", name);
        self.inner.filters.write().insert(name, Arc::new(filter));
    }

    pub fn filter(&self, name: &str) -> Option<Filter> {
        self.inner.filters.read().get(name).cloned()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &*self.inner.config.read())
            .field(
                "templates",
                &self.inner.templates.lock().keys().cloned().collect::<Vec<_>>(),
            )
            .field(
                "variables",
                &self.inner.variables.read().keys().cloned().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;
    use std::path::Path;

    fn memory_env(loader: Arc<MemoryLoader>) -> Environment {
        Environment::with_loader(EnvironmentConfig::new("/t").with_extension(".tpl"), loader)
    }

    #[test]
    fn test_resolve_path_follows_configuration() {
        let env = Environment::new("/t", ".tpl");
        assert_eq!(env.resolve_path("child"), PathBuf::from("/t/child.tpl"));

        env.set_template_dir("/views");
        env.set_extension(".html");
        assert_eq!(env.resolve_path("child"), PathBuf::from("/views/child.html"));
        assert_eq!(env.template_dir(), PathBuf::from("/views"));
        assert_eq!(env.extension(), ".html");
    }

    #[test]
    fn test_shared_variables() {
        let env = Environment::new("/t", "");
        assert!(!env.has("site"));
        assert!(matches!(env.get("site"), Err(TemplateError::NotFound(_))));

        env.set("site", "Plink");
        assert!(env.has("site"));
        assert_eq!(env.get("site").unwrap(), Value::from("Plink"));

        assert_eq!(env.remove("site"), Some(Value::from("Plink")));
        assert!(env.get_opt("site").is_none());
    }

    #[test]
    fn test_render_reuses_cached_template() {
        let loader = Arc::new(MemoryLoader::new().with_body("/t/page.tpl", |t| {
            let who = t.var("who")?;
            t.emit(&format!("hi {}", who.as_str().unwrap_or_default()));
            Ok(())
        }));
        let env = memory_env(Arc::clone(&loader));

        let mut vars = Variables::new();
        vars.insert("who".to_string(), Value::from("a"));
        assert_eq!(env.render("page", vars).unwrap(), "hi a");

        let mut vars = Variables::new();
        vars.insert("who".to_string(), Value::from("b"));
        assert_eq!(env.render("page", vars).unwrap(), "hi b");

        assert_eq!(loader.load_count(), 1);
        assert!(env.cached_template("page").is_some());

        env.clear_cache();
        assert!(env.cached_template("page").is_none());
    }

    #[test]
    fn test_render_missing_template() {
        let env = memory_env(Arc::new(MemoryLoader::new()));
        assert!(matches!(
            env.render("missing", Variables::new()),
            Err(TemplateError::NotFound(_))
        ));
    }

    #[test]
    fn test_variables_are_read_at_render_time() {
        let loader = Arc::new(MemoryLoader::new().with_body("/t/site.tpl", |t| {
            let site = t.var("site")?;
            t.emit(site.as_str().unwrap_or_default());
            Ok(())
        }));
        let env = memory_env(loader);

        env.set("site", "first");
        assert_eq!(env.render("site", Variables::new()).unwrap(), "first");
        env.set("site", "second");
        assert_eq!(env.render("site", Variables::new()).unwrap(), "second");
    }

    #[test]
    fn test_concurrent_renders_of_cached_template() {
        let loader = Arc::new(MemoryLoader::new().with_body("/t/worker.tpl", |t| {
            let id = t.var("id")?;
            t.begin(Some("id"));
            t.emit(&id.to_string());
            t.endblock()?;
            let line = format!("worker {}", t.block_content("id"));
            t.emit(&line);
            Ok(())
        }));
        let env = memory_env(loader);

        let handles: Vec<_> = (0..8u64)
            .map(|id| {
                let env = env.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let mut vars = Variables::new();
                            vars.insert("id".to_string(), Value::from(id));
                            env.render("worker", vars).unwrap()
                        })
                        .all(|output| output == format!("worker {}", id))
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(env.cached_template("worker").is_some());
    }

    #[test]
    fn test_reentrant_render_uses_fresh_template() {
        let loader = Arc::new(MemoryLoader::new().with_body("/t/nest.tpl", |t| {
            let level = t.var("level")?.as_u64().unwrap_or(0);
            t.emit(&level.to_string());
            if level > 0 {
                let env = t.environment().expect("environment alive");
                let mut vars = Variables::new();
                vars.insert("level".to_string(), Value::from(level - 1));
                let inner = env.render("nest", vars)?;
                t.emit(&inner);
            }
            Ok(())
        }));
        let env = memory_env(loader);

        let mut vars = Variables::new();
        vars.insert("level".to_string(), Value::from(2));
        assert_eq!(env.render("nest", vars).unwrap(), "210");
    }

    #[test]
    fn test_builtin_and_registered_filters() {
        let env = Environment::new("/t", "");
        let h = env.filter("h").unwrap();
        assert_eq!(h("<a>"), "&lt;a&gt;");
        assert!(env.filter("upper").is_none());

        env.register_filter("upper", |s| s.to_uppercase());
        assert_eq!(env.filter("upper").unwrap()("abc"), "ABC");
    }

    #[test]
    fn test_template_factory_is_file_less() {
        let env = Environment::new("/t", ".tpl");
        let template = env.template();
        assert!(template.name().is_none());
        assert!(template.path().is_none());
        assert!(template.environment().is_some());

        let named = env.load("page");
        assert_eq!(named.path(), Some(Path::new("/t/page.tpl")));
    }
}
