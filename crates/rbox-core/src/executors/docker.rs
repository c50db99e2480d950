// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
#[allow(deprecated)]
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::default::Default;
use std::path::Path;

use super::{
    append_bounded, bounded_text, EnvironmentHandle, IsolationBackend, ProvisionSpec, RawOutput,
    LIBRARY_VAR, RUN_DIR_VAR, WORKSPACE_VAR, WRITABLE_VAR,
};
use crate::errors::EnvironmentError;

const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_RUN_DIR: &str = "/sandbox/run";
const CONTAINER_LIBRARY: &str = "/opt/rbox/library";
const MANAGED_LABEL: &str = "rbox.managed";

/// Long-lived containers (`sleep infinity`), one `docker exec` per run.
pub struct DockerBackend {
    docker: Docker,
    image: String,
}

impl DockerBackend {
    pub async fn connect(image: impl Into<String>) -> Result<Self, EnvironmentError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            EnvironmentError::Unavailable(format!("cannot connect to Docker: {}", e))
        })?;
        docker.ping().await.map_err(|e| {
            EnvironmentError::Unavailable(format!("Docker daemon not responding: {}", e))
        })?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    async fn ensure_image(&self) -> Result<(), EnvironmentError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling image {}", self.image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(self.image.clone()),
            ..Default::default()
        });
        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(result) = pull_stream.next().await {
            if let Err(e) = result {
                return Err(EnvironmentError::Unavailable(format!(
                    "failed to pull image {}: {}",
                    self.image, e
                )));
            }
        }
        Ok(())
    }
}

fn host_path(path: &Path) -> Result<&str, EnvironmentError> {
    path.to_str().ok_or_else(|| {
        EnvironmentError::RuntimeFault(format!("non UTF-8 host path: {}", path.display()))
    })
}

fn container_name(spec: &ProvisionSpec) -> String {
    format!("rbox-env-{}", spec.id)
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<EnvironmentHandle, EnvironmentError> {
        self.ensure_image().await?;
        tokio::fs::create_dir_all(&spec.library_dir).await?;

        let library_mode = if spec.library_writable { "rw" } else { "ro" };
        let mut binds = vec![
            format!("{}:{}:rw", host_path(&spec.run_dir)?, CONTAINER_RUN_DIR),
            format!(
                "{}:{}:{}",
                host_path(&spec.library_dir)?,
                CONTAINER_LIBRARY,
                library_mode
            ),
        ];

        let (workspace, writable) = match &spec.workspace {
            Some(binding) => {
                let area = binding
                    .writable
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("r_workspace");
                let writable = format!("{}/{}", CONTAINER_WORKSPACE, area);
                binds.push(format!(
                    "{}:{}:ro",
                    host_path(&binding.root)?,
                    CONTAINER_WORKSPACE
                ));
                binds.push(format!("{}:{}:rw", host_path(&binding.writable)?, writable));
                (CONTAINER_WORKSPACE.to_string(), writable)
            }
            None => (CONTAINER_RUN_DIR.to_string(), CONTAINER_RUN_DIR.to_string()),
        };

        let env = vec![
            (RUN_DIR_VAR.to_string(), CONTAINER_RUN_DIR.to_string()),
            (WORKSPACE_VAR.to_string(), workspace),
            (WRITABLE_VAR.to_string(), writable),
            (LIBRARY_VAR.to_string(), CONTAINER_LIBRARY.to_string()),
            ("R_LIBS".to_string(), CONTAINER_LIBRARY.to_string()),
        ];

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(container_name(spec)),
            ..Default::default()
        });

        let limits = &spec.limits;
        let config = ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(CONTAINER_RUN_DIR.to_string()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory: Some((limits.memory_mb * 1024 * 1024) as i64),
                nano_cpus: Some((limits.cpu_quota * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.pids_limit),
                network_mode: if limits.network {
                    None
                } else {
                    Some("none".to_string())
                },
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &container.id,
                    Some(BollardRemoveContainerOptionsQuery {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(EnvironmentError::Unavailable(format!(
                "container {} failed to start: {}",
                container.id, e
            )));
        }
        log::debug!("Started container {}", container.id);

        Ok(EnvironmentHandle {
            backend_id: container.id,
            working_dir: CONTAINER_RUN_DIR.to_string(),
            env,
        })
    }

    #[allow(deprecated)]
    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        command: &[String],
        max_output_bytes: usize,
    ) -> Result<RawOutput, EnvironmentError> {
        let exec = self
            .docker
            .create_exec(
                &handle.backend_id,
                ExecConfig {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.to_vec()),
                    env: Some(
                        handle
                            .env
                            .iter()
                            .map(|(k, v)| format!("{}={}", k, v))
                            .collect(),
                    ),
                    working_dir: Some(handle.working_dir.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        append_bounded(&mut stdout, &message, max_output_bytes + 1);
                    }
                    LogOutput::StdErr { message } => {
                        append_bounded(&mut stderr, &message, max_output_bytes + 1);
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.ok_or_else(|| {
            EnvironmentError::RuntimeFault("exec finished without an exit code".to_string())
        })?;

        Ok(RawOutput {
            exit_code,
            stdout: bounded_text(&stdout, max_output_bytes),
            stderr: bounded_text(&stderr, max_output_bytes),
        })
    }

    async fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        self.docker
            .remove_container(
                &handle.backend_id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
