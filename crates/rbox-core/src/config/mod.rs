//! Configuration module for the execution engine
//!
//! YAML configuration (`rbox.yaml`) with per-field defaults and `RBOX_*`
//! environment overrides.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

use crate::errors::ConfigError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<RboxConfig, ConfigError> {
    ConfigLoader::from_file(path).await
}
