use super::environment::{Disposition, Environment, EnvironmentState};
use super::pool::{EnvironmentPool, PooledEnvironment};
use super::WorkspaceBinding;
use crate::errors::EnvironmentError;
use crate::script::{WrappedScript, MARKER_FILE, SCRIPT_FILE, USER_CODE_FILE};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// What came back from one harness run, before classification.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub environment_id: Uuid,
    /// State of the environment after it was handed back
    pub final_state: EnvironmentState,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub marker: Option<Vec<u8>>,
    pub primary_output: Option<Vec<u8>>,
}

/// Runs wrapped scripts in pooled environments under a wall-clock budget.
pub struct ExecutionController {
    pool: EnvironmentPool,
    max_output_bytes: usize,
}

impl ExecutionController {
    pub fn new(pool: EnvironmentPool, max_output_bytes: usize) -> Self {
        Self {
            pool,
            max_output_bytes,
        }
    }

    pub fn pool(&self) -> &EnvironmentPool {
        &self.pool
    }

    /// Run `script` in an environment bound to `binding`. On budget expiry the
    /// environment is destroyed and `EnvironmentError::Timeout` returned.
    pub async fn run(
        &self,
        script: &WrappedScript,
        binding: &WorkspaceBinding,
        budget: Duration,
    ) -> Result<RunOutcome, EnvironmentError> {
        let checkout = self.pool.checkout(binding).await?;
        self.run_in(checkout, script, budget).await
    }

    /// Run a package maintenance script in a dedicated environment.
    pub async fn run_maintenance(
        &self,
        script: &WrappedScript,
        budget: Duration,
    ) -> Result<RunOutcome, EnvironmentError> {
        let checkout = self.pool.dedicated().await?;
        self.run_in(checkout, script, budget).await
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn run_in(
        &self,
        mut checkout: PooledEnvironment,
        script: &WrappedScript,
        budget: Duration,
    ) -> Result<RunOutcome, EnvironmentError> {
        let env = checkout
            .environment_mut()
            .ok_or_else(|| EnvironmentError::RuntimeFault("environment already released".into()))?;
        let env_id = env.id();
        if let Err(e) = prepare(env, script).await {
            log::error!("Failed to prepare environment {}: {}", env_id, e);
            checkout.release(Disposition::Condemned).await;
            return Err(EnvironmentError::RuntimeFault(e.to_string()));
        }
        let handle = env.handle().clone();
        let run_dir = env.run_dir().to_path_buf();

        let command: Vec<String> = ["Rscript", "--vanilla", SCRIPT_FILE]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let backend = checkout.backend().clone();
        log::debug!(
            "Running harness in environment {} with a {}s budget",
            env_id,
            budget.as_secs()
        );

        let raw = match tokio::time::timeout(
            budget,
            backend.exec(&handle, &command, self.max_output_bytes),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                log::error!("Execution failed in environment {}: {}", env_id, e);
                checkout.release(Disposition::Condemned).await;
                return Err(match e {
                    EnvironmentError::RuntimeFault(_) | EnvironmentError::Unavailable(_) => e,
                    other => EnvironmentError::RuntimeFault(other.to_string()),
                });
            }
            Err(_) => {
                log::warn!(
                    "Script exceeded its {}s budget, destroying environment {}",
                    budget.as_secs(),
                    env_id
                );
                let state = checkout.release(Disposition::Condemned).await;
                debug_assert_eq!(state, EnvironmentState::Destroyed);
                return Err(EnvironmentError::Timeout(budget));
            }
        };

        let marker = read_optional(&run_dir.join(MARKER_FILE)).await;
        let primary_output = match &script.primary_output {
            Some(name) => read_optional(&run_dir.join(name)).await,
            None => None,
        };

        let disposition = match checkout.environment_mut() {
            Some(env) => env.finish_run(true),
            None => Disposition::Condemned,
        };
        let final_state = checkout.release(disposition).await;
        log::debug!(
            "Environment {} finished with exit code {} ({})",
            env_id,
            raw.exit_code,
            final_state
        );

        Ok(RunOutcome {
            environment_id: env_id,
            final_state,
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            marker,
            primary_output,
        })
    }
}

async fn prepare(env: &mut Environment, script: &WrappedScript) -> Result<(), EnvironmentError> {
    env.clear_run_dir().await?;
    tokio::fs::write(env.run_dir().join(SCRIPT_FILE), &script.harness).await?;
    if let Some(code) = &script.user_code {
        tokio::fs::write(env.run_dir().join(USER_CODE_FILE), code).await?;
    }
    env.begin_run()
}

async fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            log::warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}
