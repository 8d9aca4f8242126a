//! Environment configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TemplateResult;

/// Default limit on the length of an extends chain.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Configuration for an [`Environment`](crate::Environment).
///
/// ```yaml
/// template_dir: templates
/// extension: .tpl
/// max_depth: 16
/// strict_variables: false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Directory all template names are resolved against
    pub template_dir: PathBuf,
    /// Suffix appended to every template name, e.g. ".tpl"
    #[serde(default)]
    pub extension: String,
    /// Maximum number of extends hops before rendering fails
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Whether a missing `{{ name }}` in a script is an error
    #[serde(default = "default_strict")]
    pub strict_variables: bool,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_strict() -> bool {
    true
}

impl EnvironmentConfig {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            extension: String::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            strict_variables: true,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn strict_variables(mut self, strict: bool) -> Self {
        self.strict_variables = strict;
        self
    }

    /// Load a configuration file.
    ///
    /// A relative `template_dir` is resolved against the directory holding
    /// the file.
    pub fn from_yaml_file(path: &Path) -> TemplateResult<Self> {
        debug!("Loading environment config from {:?}", path);
        let content = fs::read_to_string(path)?;
        let mut config: EnvironmentConfig = serde_yaml::from_str(&content)?;

        if config.template_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.template_dir = parent.join(&config.template_dir);
            }
        }

        Ok(config)
    }

    /// Join the template directory, the name and the extension.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        self.template_dir
            .join(format!("{}{}", name, self.extension))
    }
}
