//! Engine facade: the calls the protocol layer makes.

use crate::config::{BackendKind, RboxConfig};
use crate::errors::{FailureKind, PackageError, RequestError, SandboxError, WorkspaceError};
use crate::executors::pool::PoolSettings;
use crate::executors::{
    DockerBackend, EnvironmentPool, ExecutionController, IsolationBackend, LocalBackend,
    ResourceLimits,
};
use crate::extract::{truncate_text, ResultExtractor};
use crate::packages::{PackageDescriptor, PackageListing, PackageResolver};
use crate::script::{Marker, MarkerStatus, ScriptBuilder};
use crate::types::{ExecutionRequest, ExecutionResult, ImageParams, OutputKind, SessionId};
use crate::workspace::{
    ExcelDetails, FileEntry, FileFilter, FileInfo, FileKind, MountInfo, Workspace,
    WorkspaceManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SPREADSHEET_READER: &str = "readxl";
const SPREADSHEET_BUDGET: Duration = Duration::from_secs(30);

pub struct Engine {
    config: RboxConfig,
    workspaces: WorkspaceManager,
    controller: Arc<ExecutionController>,
    packages: PackageResolver,
    scripts: ScriptBuilder,
    extractor: ResultExtractor,
}

impl Engine {
    /// Build an engine with the backend named in the configuration.
    pub async fn new(config: RboxConfig) -> Result<Self, SandboxError> {
        let backend: Arc<dyn IsolationBackend> = match config.execution.backend {
            BackendKind::Docker => Arc::new(DockerBackend::connect(config.execution.image.clone()).await?),
            BackendKind::Local => Arc::new(LocalBackend::new(&config.execution.rscript)?),
        };
        Self::with_backend(config, backend)
    }

    pub fn with_backend(
        config: RboxConfig,
        backend: Arc<dyn IsolationBackend>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;
        log::info!(
            "Starting engine with {} backend (pool size {}, reuse limit {})",
            backend.name(),
            config.execution.pool_size,
            config.execution.reuse_limit
        );

        let exec = &config.execution;
        let pool = EnvironmentPool::new(
            backend,
            PoolSettings {
                size: exec.pool_size,
                reuse_limit: exec.reuse_limit,
                checkout_timeout: exec.checkout_timeout(),
                limits: ResourceLimits {
                    memory_mb: exec.memory_limit_mb,
                    cpu_quota: exec.cpu_quota,
                    pids_limit: exec.pids_limit,
                    network: false,
                },
                library_dir: config.packages.library_dir.clone(),
            },
        );
        let controller = Arc::new(ExecutionController::new(pool, exec.max_output_bytes));
        let scripts = ScriptBuilder::new(
            config.harness.max_message_len,
            config.rendering.preload_packages.clone(),
            config.packages.repository.clone(),
        );
        let packages = PackageResolver::new(
            controller.clone(),
            scripts.clone(),
            &config.packages.repository,
            config.packages.install_timeout(),
            config.packages.max_diagnostic_len,
        )?;

        Ok(Self {
            workspaces: WorkspaceManager::new(config.workspace.clone()),
            extractor: ResultExtractor::new(config.harness.max_message_len),
            controller,
            packages,
            scripts,
            config,
        })
    }

    pub fn config(&self) -> &RboxConfig {
        &self.config
    }

    /// A text request using the configured default budget when `budget` is `None`.
    pub fn text_request(
        &self,
        session: &SessionId,
        code: &str,
        budget: Option<Duration>,
    ) -> Result<ExecutionRequest, RequestError> {
        ExecutionRequest::text(
            session.clone(),
            code,
            budget.unwrap_or_else(|| self.config.execution.time_budget()),
            self.config.execution.max_time_budget(),
        )
    }

    /// An image request; `params` falls back to the configured rendering defaults.
    pub fn image_request(
        &self,
        session: &SessionId,
        code: &str,
        params: Option<ImageParams>,
        budget: Option<Duration>,
    ) -> Result<ExecutionRequest, SandboxError> {
        let params = match params {
            Some(p) => p,
            None => self.config.rendering.default_params()?,
        };
        Ok(ExecutionRequest::image(
            session.clone(),
            code,
            params,
            budget.unwrap_or_else(|| self.config.execution.time_budget()),
            self.config.execution.max_time_budget(),
        )?)
    }

    /// Stage a file into the session workspace. Without `overwrite` an
    /// existing file of the same name is left alone and
    /// `WorkspaceError::AlreadyExists` returned.
    pub async fn stage(
        &self,
        session: &SessionId,
        name: &str,
        content: &[u8],
        declared_type: Option<&str>,
        overwrite: bool,
    ) -> Result<PathBuf, WorkspaceError> {
        let workspace = self.workspaces.open(session).await?;
        workspace.stage(name, content, declared_type, overwrite).await
    }

    pub async fn mount(&self, session: &SessionId, path: &Path) -> Result<MountInfo, WorkspaceError> {
        let previous = self.workspaces.get(session).await.map(|ws| ws.binding());
        let info = self.workspaces.mount(session, path).await?;
        if let Some(binding) = previous.filter(|b| b.root != info.root) {
            self.controller.pool().evict(&binding).await;
        }
        Ok(info)
    }

    pub async fn resolve(&self, session: &SessionId, name: &str) -> Result<PathBuf, WorkspaceError> {
        let workspace = self.workspaces.open(session).await?;
        workspace.resolve(name).await
    }

    pub async fn list_files(
        &self,
        session: &SessionId,
        filter: &FileFilter,
    ) -> Result<Vec<FileEntry>, WorkspaceError> {
        let workspace = self.workspaces.open(session).await?;
        workspace.entries(filter).await
    }

    /// File metadata; spreadsheets also get their sheet names and first-sheet
    /// shape when they can be read.
    pub async fn file_info(&self, session: &SessionId, name: &str) -> Result<FileInfo, WorkspaceError> {
        let workspace = self.workspaces.open(session).await?;
        let mut info = workspace.file_info(name).await?;
        if info.entry.kind == FileKind::Excel {
            info.excel = self.excel_details(&workspace, &info.entry.name).await;
        }
        Ok(info)
    }

    async fn excel_details(&self, workspace: &Workspace, name: &str) -> Option<ExcelDetails> {
        if let Err(e) = self
            .packages
            .ensure_installed(SPREADSHEET_READER, None, false, None)
            .await
        {
            log::warn!("Cannot inspect {}: {}", name, e);
            return None;
        }

        let script = self.scripts.excel_details_script(name);
        let budget = self.config.execution.time_budget().min(SPREADSHEET_BUDGET);
        let outcome = match self.controller.run(&script, &workspace.binding(), budget).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Spreadsheet inspection of {} failed: {}", name, e);
                return None;
            }
        };

        match outcome.marker.as_deref().and_then(|m| Marker::parse(m).ok()) {
            Some(m) if m.status == MarkerStatus::Ok => {}
            Some(m) => {
                log::warn!("Spreadsheet inspection of {} failed: {}", name, m.message);
                return None;
            }
            None => {
                log::warn!(
                    "Spreadsheet inspection of {} exited with status {}",
                    name,
                    outcome.exit_code
                );
                return None;
            }
        }
        let table = String::from_utf8_lossy(outcome.primary_output.as_deref()?).into_owned();
        ExcelDetails::from_table(&table)
    }

    /// Forget the session, its upload workspace and its idle environments.
    pub async fn close_session(&self, session: &SessionId) -> bool {
        let binding = self.workspaces.get(session).await.map(|ws| ws.binding());
        let closed = self.workspaces.close(session).await;
        if let Some(binding) = binding {
            let evicted = self.controller.pool().evict(&binding).await;
            if evicted > 0 {
                log::info!("Released {} idle environment(s) of session {}", evicted, session);
            }
        }
        closed
    }

    /// Run one request. Every failure after validation comes back as
    /// `ExecutionResult::Failure`.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let workspace = match self.workspaces.open(request.session()).await {
            Ok(ws) => ws,
            Err(e) => return ExecutionResult::failure(e.kind(), e.to_string()),
        };

        if let OutputKind::Image(_) = request.output() {
            for package in &self.config.rendering.preload_packages {
                if let Err(e) = self.packages.ensure_installed(package, None, false, None).await {
                    log::error!("Preload package {} unavailable: {}", package, e);
                    return ExecutionResult::failure(e.kind(), e.to_string());
                }
            }
        }

        let script = self.scripts.build(request);
        log::info!(
            "Executing {} request for session {}",
            match request.output() {
                OutputKind::Text => "text".to_string(),
                OutputKind::Image(p) => p.format.to_string(),
            },
            request.session()
        );

        match self
            .controller
            .run(&script, &workspace.binding(), request.time_budget())
            .await
        {
            Ok(outcome) => {
                let result = self.extractor.extract(&outcome, request.output());
                if let Some(kind) = result.failure_kind() {
                    log::info!("Request for session {} failed: {}", request.session(), kind);
                }
                result
            }
            Err(e) => {
                let kind = e.kind();
                if kind != FailureKind::Timeout {
                    log::error!("Execution infrastructure failure: {}", e);
                }
                ExecutionResult::failure(
                    kind,
                    truncate_text(&e.to_string(), self.config.harness.max_message_len),
                )
            }
        }
    }

    /// Install `name` if needed. `repository` overrides the configured
    /// package repository for this install.
    pub async fn ensure_package(
        &self,
        name: &str,
        constraint: Option<&str>,
        force: bool,
        repository: Option<&str>,
    ) -> Result<PackageDescriptor, PackageError> {
        self.packages
            .ensure_installed(name, constraint, force, repository)
            .await
    }

    pub async fn list_packages(&self, pattern: Option<&str>) -> Result<PackageListing, PackageError> {
        self.packages.list(pattern).await
    }

    /// Destroy pooled environments and upload workspaces.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        self.workspaces.close_all().await;
        log::info!("Engine shut down");
    }
}
