//! Shared helpers for the command-line tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LeafConfig;
use crate::{Error, Result};

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the verbosity flag when set.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

/// Loads a [`LeafConfig`], resolves its relative paths against the config
/// file's directory and validates it.
pub fn load_leaf_config(path: &Path) -> Result<LeafConfig> {
    let mut config: LeafConfig = load_toml_config(path)?;
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_leaf_config_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.toml");
        fs::write(
            &path,
            r#"
                [artifact]
                url = "https://models.example.com/leaf_classifier.mpk"
                path = "cache/model.mpk"

                [preprocess]
                channel_order = "bgr"
            "#,
        )
        .unwrap();

        let config = load_leaf_config(&path).unwrap();
        assert_eq!(config.artifact.path, dir.path().join("cache/model.mpk"));
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = load_toml_config::<LeafConfig>(Path::new("/nonexistent/leaf.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
