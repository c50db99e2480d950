//! Configuration types for the execution engine

use crate::errors::ConfigError;
use crate::types::{ImageFormat, ImageParams};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, usually loaded from `rbox.yaml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RboxConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for uploaded-session workspaces
    #[serde(default = "default_workspace_root")]
    pub root_dir: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Writable sub-area created under every workspace root
    #[serde(default = "default_writable_area")]
    pub writable_area: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Local,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "local" => Ok(BackendKind::Local),
            other => Err(ConfigError::Invalid {
                key: "execution.backend".to_string(),
                message: format!("unknown backend '{}', expected docker or local", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Container image for the docker backend
    #[serde(default = "default_image")]
    pub image: String,
    /// Interpreter binary for the local backend
    #[serde(default = "default_rscript")]
    pub rscript: String,
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    #[serde(default = "default_max_time_budget_secs")]
    pub max_time_budget_secs: u64,
    /// Runs an environment serves before it is drained
    #[serde(default = "default_reuse_limit")]
    pub reuse_limit: u32,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Ceiling for captured stdout and stderr, each
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl ExecutionConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn max_time_budget(&self) -> Duration {
        Duration::from_secs(self.max_time_budget_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderingConfig {
    #[serde(default = "default_format")]
    pub format: ImageFormat,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    /// Ensured before every image run
    #[serde(default = "default_preload_packages")]
    pub preload_packages: Vec<String>,
}

impl RenderingConfig {
    pub fn default_params(&self) -> Result<ImageParams, ConfigError> {
        ImageParams::new(self.format, self.width, self.height, self.resolution).map_err(|e| {
            ConfigError::Invalid {
                key: "rendering".to_string(),
                message: e.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Shared package library mounted into every environment
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    #[serde(default = "default_repository")]
    pub repository: String,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_max_diagnostic_len")]
    pub max_diagnostic_len: usize,
}

impl PackagesConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn rbox_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".rbox")
}

fn default_workspace_root() -> PathBuf {
    rbox_home().join("workspaces")
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    ["xlsx", "xls", "csv", "txt", "tsv", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_writable_area() -> String {
    "r_workspace".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Docker
}

fn default_image() -> String {
    "r-base:latest".to_string()
}

fn default_rscript() -> String {
    "Rscript".to_string()
}

fn default_time_budget_secs() -> u64 {
    60
}

fn default_max_time_budget_secs() -> u64 {
    300
}

fn default_reuse_limit() -> u32 {
    10
}

fn default_pool_size() -> usize {
    2
}

fn default_checkout_timeout_secs() -> u64 {
    30
}

fn default_memory_limit_mb() -> u64 {
    1024
}

fn default_cpu_quota() -> f64 {
    1.0
}

fn default_pids_limit() -> i64 {
    256
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_format() -> ImageFormat {
    ImageFormat::Png
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_resolution() -> u32 {
    96
}

fn default_preload_packages() -> Vec<String> {
    vec!["ggplot2".to_string(), "cowplot".to_string()]
}

fn default_library_dir() -> PathBuf {
    rbox_home().join("library")
}

fn default_repository() -> String {
    "https://cran.r-project.org".to_string()
}

fn default_install_timeout_secs() -> u64 {
    300
}

fn default_max_diagnostic_len() -> usize {
    2000
}

fn default_max_message_len() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_workspace_root(),
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
            writable_area: default_writable_area(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            image: default_image(),
            rscript: default_rscript(),
            time_budget_secs: default_time_budget_secs(),
            max_time_budget_secs: default_max_time_budget_secs(),
            reuse_limit: default_reuse_limit(),
            pool_size: default_pool_size(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_quota: default_cpu_quota(),
            pids_limit: default_pids_limit(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            width: default_width(),
            height: default_height(),
            resolution: default_resolution(),
            preload_packages: default_preload_packages(),
        }
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            repository: default_repository(),
            install_timeout_secs: default_install_timeout_secs(),
            max_diagnostic_len: default_max_diagnostic_len(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

impl RboxConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace.max_file_size == 0 {
            return Err(invalid("workspace.max_file_size", "must be greater than 0"));
        }
        if self.workspace.allowed_extensions.is_empty() {
            return Err(invalid("workspace.allowed_extensions", "cannot be empty"));
        }
        let area = &self.workspace.writable_area;
        if area.is_empty()
            || area == "."
            || area == ".."
            || area.contains(['/', '\\', '\0'])
        {
            return Err(invalid(
                "workspace.writable_area",
                "must be a single directory name",
            ));
        }

        let exec = &self.execution;
        if exec.time_budget_secs == 0 {
            return Err(invalid("execution.time_budget_secs", "must be greater than 0"));
        }
        if exec.time_budget_secs > exec.max_time_budget_secs {
            return Err(invalid(
                "execution.time_budget_secs",
                format!(
                    "default budget {}s exceeds max_time_budget_secs {}s",
                    exec.time_budget_secs, exec.max_time_budget_secs
                ),
            ));
        }
        if exec.reuse_limit == 0 {
            return Err(invalid("execution.reuse_limit", "must be greater than 0"));
        }
        if exec.pool_size == 0 {
            return Err(invalid("execution.pool_size", "must be greater than 0"));
        }
        if exec.cpu_quota <= 0.0 {
            return Err(invalid("execution.cpu_quota", "must be positive"));
        }
        if exec.memory_limit_mb == 0 {
            return Err(invalid("execution.memory_limit_mb", "must be greater than 0"));
        }
        if exec.max_output_bytes == 0 {
            return Err(invalid("execution.max_output_bytes", "must be greater than 0"));
        }

        self.rendering.default_params()?;

        if !self.packages.repository.starts_with("https://")
            && !self.packages.repository.starts_with("http://")
        {
            return Err(invalid(
                "packages.repository",
                "must be an http(s) URL",
            ));
        }

        Ok(())
    }
}
