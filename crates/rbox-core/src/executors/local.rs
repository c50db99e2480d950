//! Host `Rscript` backend for development. Provides no isolation: resource
//! limits are ignored and scripts run with the caller's own privileges.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::{
    append_bounded, bounded_text, EnvironmentHandle, IsolationBackend, ProvisionSpec, RawOutput,
    LIBRARY_VAR, RUN_DIR_VAR, WORKSPACE_VAR, WRITABLE_VAR,
};
use crate::errors::EnvironmentError;

pub struct LocalBackend {
    rscript: PathBuf,
}

impl LocalBackend {
    /// Locate `rscript` on `PATH` (or accept it as a path).
    pub fn new(rscript: &str) -> Result<Self, EnvironmentError> {
        let rscript = which::which(rscript).map_err(|e| {
            EnvironmentError::Unavailable(format!("R interpreter '{}' not found: {}", rscript, e))
        })?;
        log::warn!(
            "Using local backend with {}: scripts run without isolation",
            rscript.display()
        );
        Ok(Self { rscript })
    }
}

async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        // keep draining so the child never blocks on a full pipe
        append_bounded(&mut collected, &chunk[..n], limit + 1);
    }
    Ok(collected)
}

#[async_trait]
impl IsolationBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<EnvironmentHandle, EnvironmentError> {
        tokio::fs::create_dir_all(&spec.library_dir).await?;
        let run_dir = spec.run_dir.display().to_string();
        let (workspace, writable) = match &spec.workspace {
            Some(binding) => (
                binding.root.display().to_string(),
                binding.writable.display().to_string(),
            ),
            None => (run_dir.clone(), run_dir.clone()),
        };
        let library = spec.library_dir.display().to_string();

        Ok(EnvironmentHandle {
            backend_id: format!("local-{}", spec.id),
            working_dir: run_dir.clone(),
            env: vec![
                (RUN_DIR_VAR.to_string(), run_dir),
                (WORKSPACE_VAR.to_string(), workspace),
                (WRITABLE_VAR.to_string(), writable),
                (LIBRARY_VAR.to_string(), library.clone()),
                ("R_LIBS".to_string(), library),
            ],
        })
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &[String],
        max_output_bytes: usize,
    ) -> Result<RawOutput, EnvironmentError> {
        let args = command.get(1..).unwrap_or_default();
        let mut child = Command::new(&self.rscript)
            .args(args)
            .current_dir(&handle.working_dir)
            .envs(handle.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EnvironmentError::RuntimeFault(format!(
                    "failed to spawn {}: {}",
                    self.rscript.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EnvironmentError::RuntimeFault("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EnvironmentError::RuntimeFault("stderr not captured".into()))?;

        let (stdout, stderr, status) = tokio::try_join!(
            read_bounded(stdout, max_output_bytes),
            read_bounded(stderr, max_output_bytes),
            child.wait()
        )?;

        Ok(RawOutput {
            // killed by a signal
            exit_code: status.code().map(i64::from).unwrap_or(-1),
            stdout: bounded_text(&stdout, max_output_bytes),
            stderr: bounded_text(&stderr, max_output_bytes),
        })
    }

    async fn destroy(&self, _handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        // processes are killed when their exec future is dropped
        Ok(())
    }
}
