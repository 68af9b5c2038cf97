//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, RowMergeError};
use std::path::{Path, PathBuf};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "DATABASE_CONFIG_JSON";

impl DatabaseConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `DATABASE_CONFIG_JSON`.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CONFIG_ENV_VAR).unwrap_or_default();
        Self::from_env_value(&raw)
    }

    /// Resolve a `DATABASE_CONFIG_JSON` value to a loaded configuration.
    pub fn from_env_value(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(RowMergeError::Config(format!(
                "No database configuration available.\n  Hint: have you set {} to the path of a JSON settings file?",
                CONFIG_ENV_VAR
            )));
        }

        let path = expand_home(raw.trim());
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(RowMergeError::Config(format!(
                "Invalid database configuration file: {} (expected a .json file)",
                path.display()
            )));
        }
        if !path.exists() {
            return Err(RowMergeError::Config(format!(
                "Database configuration file {} does not exist",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let config: DatabaseConfig = serde_json::from_str(&content).map_err(|e| {
            RowMergeError::Config(format!(
                "Database configuration file {} does not contain JSON: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}
