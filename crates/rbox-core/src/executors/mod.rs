//! Execution environment controller and its isolation backends
//!
//! An `IsolationBackend` knows how to create, use and tear down one isolated
//! runtime instance. Everything above it (pooling, lifecycle, time budgets,
//! artifact retrieval) lives in `pool` and `controller` and is backend-agnostic.

pub mod controller;
pub mod docker;
pub mod environment;
pub mod local;
pub mod pool;

pub use controller::{ExecutionController, RunOutcome};
pub use docker::DockerBackend;
pub use environment::{Disposition, Environment, EnvironmentState};
pub use local::LocalBackend;
pub use pool::{EnvironmentPool, PooledEnvironment};

use crate::errors::EnvironmentError;
use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

/// Host directories a caller environment is bound to. Idle environments are
/// only reused for an identical binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceBinding {
    pub root: PathBuf,
    pub writable: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_quota: f64,
    pub pids_limit: i64,
    pub network: bool,
}

/// Everything a backend needs to create one environment.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub id: Uuid,
    /// `None` for maintenance environments
    pub workspace: Option<WorkspaceBinding>,
    /// Host directory holding the harness and its outputs
    pub run_dir: PathBuf,
    pub library_dir: PathBuf,
    pub library_writable: bool,
    pub limits: ResourceLimits,
}

/// Backend-side identity of a provisioned environment.
///
/// `env` carries the in-environment locations the harness reads
/// (`RBOX_RUN_DIR`, `RBOX_WORKSPACE`, `RBOX_WRITABLE`, `RBOX_LIBRARY`).
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub backend_id: String,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

pub const RUN_DIR_VAR: &str = "RBOX_RUN_DIR";
pub const WORKSPACE_VAR: &str = "RBOX_WORKSPACE";
pub const WRITABLE_VAR: &str = "RBOX_WRITABLE";
pub const LIBRARY_VAR: &str = "RBOX_LIBRARY";

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn provision(&self, spec: &ProvisionSpec) -> Result<EnvironmentHandle, EnvironmentError>;

    /// Run `command` to completion inside the environment. Captured streams are
    /// cut at `max_output_bytes` each. Dropping the returned future must stop
    /// the command or leave it for `destroy` to reap.
    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &[String],
        max_output_bytes: usize,
    ) -> Result<RawOutput, EnvironmentError>;

    async fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError>;
}

/// Append `chunk` to `buf` without letting `buf` grow past `limit` bytes.
/// Returns false once the limit has been hit.
pub(crate) fn append_bounded(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buf.len());
    if chunk.len() <= room {
        buf.extend_from_slice(chunk);
        true
    } else {
        buf.extend_from_slice(&chunk[..room]);
        false
    }
}

pub(crate) fn bounded_text(bytes: &[u8], limit: usize) -> String {
    let cut = &bytes[..bytes.len().min(limit)];
    let mut text = String::from_utf8_lossy(cut).into_owned();
    if bytes.len() > limit {
        text.push_str("\n... [output truncated]");
    }
    text
}
