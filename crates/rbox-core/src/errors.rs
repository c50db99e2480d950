//! Error types for the sandboxed execution engine
//!
//! Every component reports failures through its own enum so callers can match on
//! the precise cause, while `FailureKind` gives the flat, caller-facing taxonomy
//! that ends up inside `ExecutionResult::Failure`. Host-level details (Docker
//! API errors, I/O errors) are kept on the component errors and only leave the
//! engine as bounded text.

use crate::executors::environment::EnvironmentState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Caller-facing failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidName,
    UnsupportedType,
    TooLarge,
    PathEscape,
    NotFound,
    NotADirectory,
    AlreadyExists,
    Timeout,
    EnvironmentUnavailable,
    RuntimeFault,
    CallerError,
    HarnessError,
    InstallFailed,
    EmptyArtifact,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidName => "invalid_name",
            FailureKind::UnsupportedType => "unsupported_type",
            FailureKind::TooLarge => "too_large",
            FailureKind::PathEscape => "path_escape",
            FailureKind::NotFound => "not_found",
            FailureKind::NotADirectory => "not_a_directory",
            FailureKind::AlreadyExists => "already_exists",
            FailureKind::Timeout => "timeout",
            FailureKind::EnvironmentUnavailable => "environment_unavailable",
            FailureKind::RuntimeFault => "runtime_fault",
            FailureKind::CallerError => "caller_error",
            FailureKind::HarnessError => "harness_error",
            FailureKind::InstallFailed => "install_failed",
            FailureKind::EmptyArtifact => "empty_artifact",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Invalid file name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("File type '{extension}' not allowed. Supported: {allowed}")]
    UnsupportedType { extension: String, allowed: String },
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("Path '{}' escapes workspace root '{}'", .path.display(), .root.display())]
    PathEscape { path: PathBuf, root: PathBuf },
    #[error("File not found: {name}{}", format_suggestions(.suggestions))]
    NotFound { name: String, suggestions: Vec<String> },
    #[error("Path is not a directory: {}", .path.display())]
    NotADirectory { path: PathBuf },
    #[error("File '{name}' already exists. Stage with overwrite to replace it.")]
    AlreadyExists { name: String },
    #[error("I/O error in workspace: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            WorkspaceError::InvalidName { .. } => FailureKind::InvalidName,
            WorkspaceError::UnsupportedType { .. } => FailureKind::UnsupportedType,
            WorkspaceError::TooLarge { .. } => FailureKind::TooLarge,
            WorkspaceError::PathEscape { .. } => FailureKind::PathEscape,
            WorkspaceError::NotFound { .. } => FailureKind::NotFound,
            WorkspaceError::NotADirectory { .. } => FailureKind::NotADirectory,
            WorkspaceError::AlreadyExists { .. } => FailureKind::AlreadyExists,
            WorkspaceError::Io(_) => FailureKind::RuntimeFault,
        }
    }
}

// Specific error for the execution environment controller and its backends
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Script execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Execution environment unavailable: {0}")]
    Unavailable(String),
    #[error("Runtime fault: {0}")]
    RuntimeFault(String),
    #[error("Bollard (Docker client) error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("I/O error in execution environment: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid environment transition from {from} to {to}")]
    InvalidTransition {
        from: EnvironmentState,
        to: EnvironmentState,
    },
}

impl EnvironmentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EnvironmentError::Timeout(_) => FailureKind::Timeout,
            EnvironmentError::Unavailable(_) => FailureKind::EnvironmentUnavailable,
            _ => FailureKind::RuntimeFault,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    #[error("Invalid package name '{0}'. Names start with a letter and contain only letters, digits and dots.")]
    InvalidName(String),
    #[error("Invalid version constraint '{0}'")]
    InvalidConstraint(String),
    #[error("Invalid repository URL '{0}'")]
    InvalidRepository(String),
    #[error("Installation of '{package}' failed: {reason}")]
    InstallFailed { package: String, reason: String },
    #[error("Package query failed: {0}")]
    QueryFailed(String),
}

impl PackageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PackageError::InvalidName(_)
            | PackageError::InvalidConstraint(_)
            | PackageError::InvalidRepository(_) => FailureKind::InvalidName,
            PackageError::InstallFailed { .. } => FailureKind::InstallFailed,
            PackageError::QueryFailed(_) => FailureKind::RuntimeFault,
        }
    }
}

/// Rejections raised while constructing an `ExecutionRequest`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Code is required")]
    EmptyCode,
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("Unsupported image format '{0}'. Supported: png, jpeg, pdf, svg")]
    UnknownFormat(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Unified error for engine construction and entry points.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::EnvironmentUnavailable).unwrap();
        assert_eq!(json, "\"environment_unavailable\"");
        assert_eq!(FailureKind::CallerError.to_string(), "caller_error");
        assert_eq!(
            WorkspaceError::AlreadyExists { name: "a.csv".into() }.kind().as_str(),
            "already_exists"
        );
    }

    #[test]
    fn test_not_found_lists_suggestions() {
        let err = WorkspaceError::NotFound {
            name: "Data.CSV".to_string(),
            suggestions: vec!["data.csv".to_string()],
        };
        assert_eq!(err.to_string(), "File not found: Data.CSV (did you mean: data.csv?)");
        assert_eq!(err.kind(), FailureKind::NotFound);

        let err = WorkspaceError::NotFound {
            name: "x.csv".to_string(),
            suggestions: vec![],
        };
        assert_eq!(err.to_string(), "File not found: x.csv");
    }

    #[test]
    fn test_environment_error_kinds() {
        assert_eq!(
            EnvironmentError::Timeout(Duration::from_secs(3)).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            EnvironmentError::Unavailable("docker down".into()).kind(),
            FailureKind::EnvironmentUnavailable
        );
        assert_eq!(
            EnvironmentError::RuntimeFault("exec failed".into()).kind(),
            FailureKind::RuntimeFault
        );
    }
}
