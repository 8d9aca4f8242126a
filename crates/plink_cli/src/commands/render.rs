//! Render command - Render a template with variables.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use plink_engine::Variables;
use serde_json::Value;
use tracing::{debug, info};

use super::EnvironmentArgs;

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Template name, relative to the templates directory and without extension
    name: String,

    #[command(flatten)]
    env: EnvironmentArgs,

    /// Variable bound to this render (repeatable), as key=value
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// Variable shared with every template in the chain (repeatable), as key=value
    #[arg(long = "shared", value_name = "KEY=VALUE")]
    shared: Vec<String>,

    /// YAML or JSON file holding a map of variables
    #[arg(long)]
    vars_file: Option<PathBuf>,

    /// Write the output here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

pub fn execute(args: RenderArgs) -> Result<()> {
    let env = args.env.environment()?;

    let mut variables = match &args.vars_file {
        Some(path) => load_vars_file(path)?,
        None => Variables::new(),
    };
    for assignment in &args.vars {
        let (key, value) = parse_assignment(assignment)?;
        variables.insert(key, value);
    }
    for assignment in &args.shared {
        let (key, value) = parse_assignment(assignment)?;
        env.set(&key, value);
    }

    info!("Rendering {} from {:?}", args.name, env.template_dir());
    let output = env
        .render(&args.name, variables)
        .with_context(|| format!("Failed to render template {}", args.name))?;

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, &output)
                .with_context(|| format!("Failed to write output to {:?}", path))?;
            info!("Wrote {} bytes to {:?}", output.len(), path);
        }
        None => print!("{}", output),
    }

    Ok(())
}

/// Split `key=value`. The value is always a string.
fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    let (key, value) = assignment
        .split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .with_context(|| format!("Invalid variable assignment '{}', expected KEY=VALUE", assignment))?;
    Ok((key.trim().to_string(), Value::String(value.to_string())))
}

/// Load a variables map. `.json` files are parsed as JSON, anything else as YAML.
fn load_vars_file(path: &Path) -> Result<Variables> {
    debug!("Loading variables from {:?}", path);
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let variables = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON variables in {:?}", path))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML variables in {:?}", path))?
    };
    Ok(variables)
}
