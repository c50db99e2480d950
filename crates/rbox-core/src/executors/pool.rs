//! Bounded environment pool with checkout/return.
//!
//! A semaphore with `size` permits caps the number of environments checked out
//! at once. Idle environments are kept per workspace binding in least-recently
//! returned order, and the oldest ones are evicted whenever checked-out plus
//! idle environments would exceed `size`.

use super::environment::{Disposition, Environment, EnvironmentState};
use super::{IsolationBackend, ProvisionSpec, ResourceLimits, WorkspaceBinding};
use crate::errors::EnvironmentError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub reuse_limit: u32,
    pub checkout_timeout: Duration,
    pub limits: ResourceLimits,
    pub library_dir: PathBuf,
}

struct PoolInner {
    backend: Arc<dyn IsolationBackend>,
    settings: PoolSettings,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Environment>>,
}

impl PoolInner {
    async fn provision(
        &self,
        binding: Option<WorkspaceBinding>,
        limits: ResourceLimits,
        library_writable: bool,
    ) -> Result<Environment, EnvironmentError> {
        let run_dir = tempfile::Builder::new().prefix("rbox-run-").tempdir()?;
        let spec = ProvisionSpec {
            id: Uuid::new_v4(),
            workspace: binding.clone(),
            run_dir: run_dir.path().to_path_buf(),
            library_dir: self.settings.library_dir.clone(),
            library_writable,
            limits,
        };

        let handle = self.backend.provision(&spec).await.map_err(|e| match e {
            EnvironmentError::Unavailable(_) => e,
            other => EnvironmentError::Unavailable(format!(
                "{} backend failed to start an environment: {}",
                self.backend.name(),
                other
            )),
        })?;

        let mut env = Environment::new(
            spec.id,
            handle,
            binding,
            run_dir,
            self.settings.reuse_limit,
        );
        env.mark_ready()?;
        log::info!(
            "Provisioned environment {} ({} backend)",
            env.id(),
            self.backend.name()
        );
        Ok(env)
    }

    async fn destroy(&self, mut env: Environment) {
        env.condemn();
        if let Err(e) = self.backend.destroy(env.handle()).await {
            log::warn!("Failed to destroy environment {}: {}", env.id(), e);
        }
        env.mark_destroyed();
        log::info!("Destroyed environment {} after {} run(s)", env.id(), env.runs());
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Environment>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked_out(&self) -> usize {
        self.settings
            .size
            .saturating_sub(self.slots.available_permits())
    }
}

/// Bounded pool of caller environments.
#[derive(Clone)]
pub struct EnvironmentPool {
    inner: Arc<PoolInner>,
}

impl EnvironmentPool {
    pub fn new(backend: Arc<dyn IsolationBackend>, settings: PoolSettings) -> Self {
        let slots = Arc::new(Semaphore::new(settings.size));
        Self {
            inner: Arc::new(PoolInner {
                backend,
                settings,
                slots,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.inner.backend
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    /// Check out an environment bound to `binding`, waiting at most the
    /// configured checkout timeout for a free slot.
    pub async fn checkout(
        &self,
        binding: &WorkspaceBinding,
    ) -> Result<PooledEnvironment, EnvironmentError> {
        let inner = &self.inner;
        let timeout = inner.settings.checkout_timeout;
        let permit = match tokio::time::timeout(timeout, inner.slots.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(EnvironmentError::Unavailable(
                    "environment pool is shut down".to_string(),
                ))
            }
            Err(_) => {
                log::warn!(
                    "No environment slot became free within {}s",
                    timeout.as_secs()
                );
                return Err(EnvironmentError::Unavailable(format!(
                    "all {} environments busy for {}s",
                    inner.settings.size,
                    timeout.as_secs()
                )));
            }
        };

        let evicted = {
            let mut idle = inner.lock_idle();
            if let Some(pos) = idle.iter().position(|e| e.binding() == Some(binding)) {
                let env = idle.remove(pos);
                log::debug!("Reusing idle environment {}", env.id());
                return Ok(PooledEnvironment::new(env, Some(permit), inner.clone()));
            }
            let mut evicted = Vec::new();
            while !idle.is_empty() && idle.len() + inner.checked_out() > inner.settings.size {
                evicted.push(idle.remove(0));
            }
            evicted
        };

        for env in evicted {
            log::debug!("Evicting idle environment {} to make room", env.id());
            inner.destroy(env).await;
        }

        let env = inner
            .provision(Some(binding.clone()), inner.settings.limits.clone(), false)
            .await?;
        Ok(PooledEnvironment::new(env, Some(permit), inner.clone()))
    }

    /// A never-pooled environment with network access and a writable package
    /// library. It does not take a pool slot and is destroyed on release.
    pub async fn dedicated(&self) -> Result<PooledEnvironment, EnvironmentError> {
        let limits = ResourceLimits {
            network: true,
            ..self.inner.settings.limits.clone()
        };
        let env = self.inner.provision(None, limits, true).await?;
        Ok(PooledEnvironment::new(env, None, self.inner.clone()))
    }

    /// Destroy the idle environments bound to `binding`, returning how many
    /// there were. Checked-out environments are not touched.
    pub async fn evict(&self, binding: &WorkspaceBinding) -> usize {
        let evicted: Vec<Environment> = {
            let mut idle = self.inner.lock_idle();
            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *idle)
                .into_iter()
                .partition(|e| e.binding() == Some(binding));
            *idle = rest;
            matching
        };
        let count = evicted.len();
        for env in evicted {
            log::debug!("Evicting idle environment {} of a closed workspace", env.id());
            self.inner.destroy(env).await;
        }
        count
    }

    /// Destroy every idle environment and refuse further checkouts.
    pub async fn shutdown(&self) {
        self.inner.slots.close();
        let idle: Vec<Environment> = std::mem::take(&mut *self.inner.lock_idle());
        for env in idle {
            self.inner.destroy(env).await;
        }
    }
}

/// A checked-out environment. Hand it back with [`PooledEnvironment::release`];
/// dropping it instead destroys the environment in the background.
pub struct PooledEnvironment {
    env: Option<Environment>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledEnvironment {
    fn new(env: Environment, permit: Option<OwnedSemaphorePermit>, pool: Arc<PoolInner>) -> Self {
        Self {
            env: Some(env),
            permit,
            pool,
        }
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.env.as_ref()
    }

    pub fn environment_mut(&mut self) -> Option<&mut Environment> {
        self.env.as_mut()
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.pool.backend
    }

    /// Return the environment. A reusable environment of a pooled checkout
    /// goes back to the idle list; everything else is destroyed. Returns the
    /// environment's final state.
    pub async fn release(mut self, disposition: Disposition) -> EnvironmentState {
        let Some(mut env) = self.env.take() else {
            return EnvironmentState::Destroyed;
        };
        let pooled = self.permit.is_some();

        if pooled && disposition == Disposition::Reusable && env.state() == EnvironmentState::Ready
        {
            let state = env.state();
            let evicted = {
                let mut idle = self.pool.lock_idle();
                idle.push(env);
                let mut evicted = Vec::new();
                // our permit is still held here, so it is counted as checked out
                while idle.len() + self.pool.checked_out().saturating_sub(1) > self.pool.settings.size
                {
                    evicted.push(idle.remove(0));
                }
                evicted
            };
            self.permit.take();
            for old in evicted {
                self.pool.destroy(old).await;
            }
            return state;
        }

        env.condemn();
        self.pool.destroy(env).await;
        self.permit.take();
        EnvironmentState::Destroyed
    }
}

impl Drop for PooledEnvironment {
    fn drop(&mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        log::warn!(
            "Environment {} dropped while checked out, destroying it",
            env.id()
        );
        let pool = self.pool.clone();
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.destroy(env).await;
                    drop(permit);
                });
            }
            Err(_) => {
                log::error!(
                    "No async runtime available to destroy environment {}",
                    env.id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{EnvironmentHandle, RawOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        provisioned: AtomicUsize,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl IsolationBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn provision(
            &self,
            spec: &ProvisionSpec,
        ) -> Result<EnvironmentHandle, EnvironmentError> {
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(EnvironmentHandle {
                backend_id: spec.id.to_string(),
                working_dir: spec.run_dir.display().to_string(),
                env: vec![],
            })
        }

        async fn exec(
            &self,
            _handle: &EnvironmentHandle,
            _command: &[String],
            _max_output_bytes: usize,
        ) -> Result<RawOutput, EnvironmentError> {
            Ok(RawOutput::default())
        }

        async fn destroy(&self, _handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(size: usize, backend: Arc<CountingBackend>) -> EnvironmentPool {
        EnvironmentPool::new(
            backend,
            PoolSettings {
                size,
                reuse_limit: 10,
                checkout_timeout: Duration::from_millis(100),
                limits: ResourceLimits {
                    memory_mb: 512,
                    cpu_quota: 1.0,
                    pids_limit: 64,
                    network: false,
                },
                library_dir: std::env::temp_dir(),
            },
        )
    }

    fn binding(name: &str) -> WorkspaceBinding {
        WorkspaceBinding {
            root: PathBuf::from(format!("/ws/{}", name)),
            writable: PathBuf::from(format!("/ws/{}/r_workspace", name)),
        }
    }

    #[tokio::test]
    async fn test_reuses_environment_for_same_binding() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(2, backend.clone());

        let first = pool.checkout(&binding("a")).await.unwrap();
        let id = first.environment().unwrap().id();
        assert_eq!(first.release(Disposition::Reusable).await, EnvironmentState::Ready);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.checkout(&binding("a")).await.unwrap();
        assert_eq!(second.environment().unwrap().id(), id);
        second.release(Disposition::Reusable).await;
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_condemned_environment_is_destroyed() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(1, backend.clone());

        let env = pool.checkout(&binding("a")).await.unwrap();
        assert_eq!(
            env.release(Disposition::Condemned).await,
            EnvironmentState::Destroyed
        );
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_checkout_times_out_when_pool_exhausted() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(1, backend.clone());

        let held = pool.checkout(&binding("a")).await.unwrap();
        let err = pool.checkout(&binding("b")).await.err().unwrap();
        assert!(matches!(err, EnvironmentError::Unavailable(_)));
        held.release(Disposition::Reusable).await;
    }

    #[tokio::test]
    async fn test_idle_environment_of_other_binding_is_evicted() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(1, backend.clone());

        pool.checkout(&binding("a"))
            .await
            .unwrap()
            .release(Disposition::Reusable)
            .await;
        let b = pool.checkout(&binding("b")).await.unwrap();
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 2);
        b.release(Disposition::Reusable).await;
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_checkout_is_destroyed_in_background() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(1, backend.clone());

        drop(pool.checkout(&binding("a")).await.unwrap());
        // the slot is only released once the background destroy has run
        let again = pool.checkout(&binding("a")).await.unwrap();
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 2);
        again.release(Disposition::Reusable).await;
    }

    #[tokio::test]
    async fn test_evict_only_touches_matching_binding() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(2, backend.clone());

        let a = pool.checkout(&binding("a")).await.unwrap();
        let b = pool.checkout(&binding("b")).await.unwrap();
        a.release(Disposition::Reusable).await;
        b.release(Disposition::Reusable).await;
        assert_eq!(pool.idle_count(), 2);

        assert_eq!(pool.evict(&binding("a")).await, 1);
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.evict(&binding("a")).await, 0);

        // the other binding's environment is still reused
        let again = pool.checkout(&binding("b")).await.unwrap();
        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 2);
        again.release(Disposition::Reusable).await;
    }

    #[tokio::test]
    async fn test_dedicated_environment_never_pooled() {
        let backend = Arc::new(CountingBackend::default());
        let pool = pool(1, backend.clone());

        let env = pool.dedicated().await.unwrap();
        assert!(env.environment().unwrap().binding().is_none());
        assert_eq!(
            env.release(Disposition::Reusable).await,
            EnvironmentState::Destroyed
        );
        assert_eq!(pool.idle_count(), 0);
    }
}
