//! Command implementations for the go2jail CLI.

pub mod mail;
pub mod regex;
pub mod run;
pub mod test_config;

use std::path::PathBuf;

use anyhow::{Context, Result};

use go2jail_pipeline::config::{Config, Registry};

use crate::cli::ConfigArgs;

/// Discover YAML configuration files in the directory, lexicographically.
pub fn discover_config_files(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read config directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    if files.is_empty() {
        anyhow::bail!("cannot find config in {}", dir.display());
    }
    Ok(files)
}

/// Load the merged configuration per the shared config flags.
pub fn load_config(args: &ConfigArgs) -> Result<Config> {
    let files = discover_config_files(&args.config_dir)?;
    let registry = Registry::builtin();
    let config = Config::load_files(&registry, &files, args.strict_config)?;
    Ok(config)
}

/// Wait for SIGTERM or SIGINT. Returns the signal name.
pub async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {e}"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {e}"))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_yaml_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-b.yaml"), "").unwrap();
        std::fs::write(dir.path().join("10-a.yml"), "").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub.yaml")).unwrap();

        let files = discover_config_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["10-a.yml", "20-b.yaml"]);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_config_files(dir.path()).unwrap_err();
        assert!(err.to_string().contains("cannot find config"));
    }
}
