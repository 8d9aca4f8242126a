//! Check command - Parse every template in a directory.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use plink_engine::{EnvironmentConfig, Script};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::EnvironmentArgs;

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    env: EnvironmentArgs,
}

pub fn execute(args: CheckArgs) -> Result<()> {
    let config = args.env.config()?;
    info!("Checking templates in {:?}", config.template_dir);

    if !config.template_dir.is_dir() {
        anyhow::bail!("Templates directory not found: {:?}", config.template_dir);
    }

    let failures = check_dir(&config)?;
    if !failures.is_empty() {
        for (path, error) in &failures {
            println!("FAIL {}: {}", path.display(), error);
        }
        anyhow::bail!("{} template(s) failed the syntax check", failures.len());
    }

    Ok(())
}

/// Parse every template under the configured directory and collect failures.
fn check_dir(config: &EnvironmentConfig) -> Result<Vec<(PathBuf, String)>> {
    let mut failures = Vec::new();
    let mut checked = 0;

    for entry in WalkDir::new(&config.template_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if !config.extension.is_empty()
            && !path.to_string_lossy().ends_with(config.extension.as_str())
        {
            continue;
        }

        checked += 1;
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                failures.push((path.to_path_buf(), format!("unreadable: {}", e)));
                continue;
            }
        };
        match Script::parse(path, &source) {
            Ok(_) => debug!("OK {:?}", path),
            Err(e) => failures.push((path.to_path_buf(), e.to_string())),
        }
    }

    println!(
        "Checked {} template(s): {} passed, {} failed",
        checked,
        checked - failures.len(),
        failures.len()
    );
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_check_dir_reports_broken_templates() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("good.tpl"), "{% block a %}x{% endblock %}").unwrap();
        fs::write(temp.path().join("bad.tpl"), "{% block a %}x").unwrap();
        fs::write(temp.path().join("notes.txt"), "{% not a template").unwrap();

        let config = EnvironmentConfig::new(temp.path()).with_extension(".tpl");
        let failures = check_dir(&config).unwrap();

        assert_eq!(failures.len(), 1);
        assert!(failures[0].0.ends_with("bad.tpl"));
    }

    #[test]
    fn test_check_dir_reports_unreadable_files_and_continues() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("binary.tpl"), [0xff, 0xfe, 0x00, 0x80]).unwrap();
        fs::write(temp.path().join("broken.tpl"), "{% endblock %}").unwrap();
        fs::write(temp.path().join("fine.tpl"), "hello").unwrap();

        let config = EnvironmentConfig::new(temp.path()).with_extension(".tpl");
        let mut failures = check_dir(&config).unwrap();
        failures.sort();

        assert_eq!(failures.len(), 2);
        assert!(failures[0].0.ends_with("binary.tpl"));
        assert!(failures[0].1.starts_with("unreadable"));
        assert!(failures[1].0.ends_with("broken.tpl"));
    }
}
