//! Configuration loader for YAML files and environment overrides
//!
//! Values are read from YAML first, then `RBOX_*` environment variables
//! replace individual fields, and finally the merged result is validated.

use crate::config::types::*;
use crate::errors::ConfigError;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<RboxConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        log::debug!("Loaded configuration file {}", path.display());
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<RboxConfig, ConfigError> {
        let mut config: RboxConfig = if content.trim().is_empty() {
            RboxConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<RboxConfig, ConfigError> {
        Self::from_str("")
    }

    fn apply_env_overrides(config: &mut RboxConfig) -> Result<(), ConfigError> {
        Self::apply_env_overrides_from(config, |key| env::var(key).ok())
    }

    /// Apply `RBOX_*` overrides using `lookup` as the variable source
    pub fn apply_env_overrides_from<F>(config: &mut RboxConfig, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RBOX_MAX_FILE_SIZE") {
            config.workspace.max_file_size = parse_var("RBOX_MAX_FILE_SIZE", &v)?;
        }
        if let Some(v) = lookup("RBOX_ALLOWED_EXTENSIONS") {
            config.workspace.allowed_extensions = v
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        if let Some(v) = lookup("RBOX_WORKSPACE_ROOT") {
            config.workspace.root_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RBOX_BACKEND") {
            config.execution.backend = BackendKind::from_str(&v)?;
        }
        if let Some(v) = lookup("RBOX_IMAGE") {
            config.execution.image = v;
        }
        if let Some(v) = lookup("RBOX_TIME_BUDGET_SECS") {
            config.execution.time_budget_secs = parse_var("RBOX_TIME_BUDGET_SECS", &v)?;
        }
        if let Some(v) = lookup("RBOX_REUSE_LIMIT") {
            config.execution.reuse_limit = parse_var("RBOX_REUSE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("RBOX_POOL_SIZE") {
            config.execution.pool_size = parse_var("RBOX_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("RBOX_DEFAULT_FORMAT") {
            config.rendering.format = v.parse().map_err(|e: crate::errors::RequestError| {
                ConfigError::Invalid {
                    key: "RBOX_DEFAULT_FORMAT".to_string(),
                    message: e.to_string(),
                }
            })?;
        }
        if let Some(v) = lookup("RBOX_DEFAULT_WIDTH") {
            config.rendering.width = parse_var("RBOX_DEFAULT_WIDTH", &v)?;
        }
        if let Some(v) = lookup("RBOX_DEFAULT_HEIGHT") {
            config.rendering.height = parse_var("RBOX_DEFAULT_HEIGHT", &v)?;
        }
        if let Some(v) = lookup("RBOX_DEFAULT_RESOLUTION") {
            config.rendering.resolution = parse_var("RBOX_DEFAULT_RESOLUTION", &v)?;
        }
        if let Some(v) = lookup("RBOX_LIBRARY_DIR") {
            config.packages.library_dir = PathBuf::from(v);
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("'{}': {}", value, e),
    })
}
