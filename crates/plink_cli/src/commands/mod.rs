//! CLI command definitions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use plink_engine::{Environment, EnvironmentConfig};

pub mod check;
pub mod render;

/// Plink - template inheritance renderer
#[derive(Parser)]
#[command(name = "plink")]
#[command(version, about = "Plink - render templates with block inheritance")]
#[command(long_about = r#"
Plink renders templates that extend one another. A child template defines
named blocks; the layout it extends decides where they appear.

COMMANDS:
  render  → Render a template to stdout or a file
  check   → Parse every template in a directory and report syntax errors

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  4 - Template error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a template
    Render(render::RenderArgs),

    /// Check every template in a directory for syntax errors
    Check(check::CheckArgs),
}

/// Options locating the templates.
#[derive(Args, Debug)]
pub struct EnvironmentArgs {
    /// Templates directory
    #[arg(short, long, default_value = "templates")]
    pub dir: PathBuf,

    /// Extension appended to template names (e.g. ".tpl")
    #[arg(short, long, default_value = "")]
    pub ext: String,

    /// YAML configuration file; overrides --dir and --ext
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl EnvironmentArgs {
    pub fn config(&self) -> Result<EnvironmentConfig> {
        match &self.config {
            Some(path) => EnvironmentConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config {:?}", path)),
            None => Ok(EnvironmentConfig::new(&self.dir).with_extension(&self.ext)),
        }
    }

    pub fn environment(&self) -> Result<Environment> {
        Ok(Environment::from_config(self.config()?))
    }
}
