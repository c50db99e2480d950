use super::{EnvironmentHandle, WorkspaceBinding};
use crate::errors::EnvironmentError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tempfile::TempDir;
use uuid::Uuid;

/// Lifecycle: `provisioning -> ready -> running -> ready | draining -> destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentState {
    Provisioning,
    Ready,
    Running,
    Draining,
    Destroyed,
}

impl EnvironmentState {
    fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        matches!(
            (self, next),
            (Provisioning, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Provisioning | Ready | Running, Draining)
                | (Draining, Destroyed)
        )
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Provisioning => "provisioning",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Running => "running",
            EnvironmentState::Draining => "draining",
            EnvironmentState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// How an environment goes back to the pool after a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Reusable,
    /// Can only be destroyed
    Condemned,
}

/// One isolated runtime instance, owned by the pool or by whoever checked it out.
#[derive(Debug)]
pub struct Environment {
    id: Uuid,
    handle: EnvironmentHandle,
    binding: Option<WorkspaceBinding>,
    run_dir: TempDir,
    state: EnvironmentState,
    runs: u32,
    reuse_limit: u32,
    created_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(
        id: Uuid,
        handle: EnvironmentHandle,
        binding: Option<WorkspaceBinding>,
        run_dir: TempDir,
        reuse_limit: u32,
    ) -> Self {
        Self {
            id,
            handle,
            binding,
            run_dir,
            state: EnvironmentState::Provisioning,
            runs: 0,
            reuse_limit,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    pub fn binding(&self) -> Option<&WorkspaceBinding> {
        self.binding.as_ref()
    }

    pub fn run_dir(&self) -> &Path {
        self.run_dir.path()
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn transition(&mut self, next: EnvironmentState) -> Result<(), EnvironmentError> {
        if !self.state.can_transition_to(next) {
            return Err(EnvironmentError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Environment {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<(), EnvironmentError> {
        self.transition(EnvironmentState::Ready)
    }

    pub fn begin_run(&mut self) -> Result<(), EnvironmentError> {
        self.transition(EnvironmentState::Running)
    }

    /// Close out a run. `clean` is false when the execution infrastructure
    /// itself failed; such environments are never reused.
    pub fn finish_run(&mut self, clean: bool) -> Disposition {
        self.runs += 1;
        if clean && self.runs < self.reuse_limit && self.transition(EnvironmentState::Ready).is_ok()
        {
            return Disposition::Reusable;
        }
        self.condemn();
        Disposition::Condemned
    }

    /// Move to `draining` from any live state.
    pub fn condemn(&mut self) {
        if self.state != EnvironmentState::Draining && self.state != EnvironmentState::Destroyed {
            self.state = EnvironmentState::Draining;
        }
    }

    pub fn mark_destroyed(&mut self) {
        self.condemn();
        self.state = EnvironmentState::Destroyed;
    }

    /// Remove leftovers of the previous run so a stale marker or artifact is
    /// never mistaken for fresh output.
    pub async fn clear_run_dir(&self) -> Result<(), EnvironmentError> {
        let mut entries = tokio::fs::read_dir(self.run_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(reuse_limit: u32) -> Environment {
        let handle = EnvironmentHandle {
            backend_id: "test".to_string(),
            working_dir: "/tmp".to_string(),
            env: vec![],
        };
        Environment::new(
            Uuid::new_v4(),
            handle,
            None,
            tempfile::tempdir().unwrap(),
            reuse_limit,
        )
    }

    #[test]
    fn test_lifecycle_until_reuse_limit() {
        let mut env = environment(2);
        assert_eq!(env.state(), EnvironmentState::Provisioning);
        env.mark_ready().unwrap();

        env.begin_run().unwrap();
        assert_eq!(env.finish_run(true), Disposition::Reusable);
        assert_eq!(env.state(), EnvironmentState::Ready);

        env.begin_run().unwrap();
        assert_eq!(env.finish_run(true), Disposition::Condemned);
        assert_eq!(env.state(), EnvironmentState::Draining);
        assert_eq!(env.runs(), 2);
    }

    #[test]
    fn test_infrastructure_failure_condemns() {
        let mut env = environment(10);
        env.mark_ready().unwrap();
        env.begin_run().unwrap();
        assert_eq!(env.finish_run(false), Disposition::Condemned);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut env = environment(10);
        let err = env.begin_run().unwrap_err();
        assert!(matches!(
            err,
            EnvironmentError::InvalidTransition {
                from: EnvironmentState::Provisioning,
                to: EnvironmentState::Running
            }
        ));

        env.mark_destroyed();
        assert_eq!(env.state(), EnvironmentState::Destroyed);
        assert!(env.mark_ready().is_err());
    }

    #[tokio::test]
    async fn test_clear_run_dir() {
        let env = environment(1);
        tokio::fs::write(env.run_dir().join("marker.json"), b"{}")
            .await
            .unwrap();
        tokio::fs::create_dir(env.run_dir().join("nested")).await.unwrap();
        env.clear_run_dir().await.unwrap();
        let mut entries = tokio::fs::read_dir(env.run_dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
