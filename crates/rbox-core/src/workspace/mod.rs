//! Workspace manager
//!
//! Each session owns a directory tree: either a fresh directory for uploads
//! or a mounted host directory. Files are staged into the writable sub-area.
//! Every path handed out is checked to canonicalize under the workspace root.

pub mod listing;
pub mod names;
pub mod suggest;

pub use listing::{glob_to_regex, FileArea, FileEntry, FileFilter, FileKind, FileListing};
pub use names::sanitize_name;

use crate::config::WorkspaceConfig;
use crate::errors::WorkspaceError;
use crate::executors::WorkspaceBinding;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

const MOUNT_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    Uploaded,
    HostDirectory,
}

/// Metadata recorded for a staged file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub size: u64,
    pub sha256: String,
    pub declared_type: Option<String>,
    pub staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub root: PathBuf,
    pub writable_area: PathBuf,
    pub sample: Vec<String>,
    pub total_entries: usize,
}

/// Sheet names and first-sheet shape of a spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcelDetails {
    pub sheets: Vec<String>,
    pub rows: u64,
    pub columns: u64,
    pub column_names: Vec<String>,
}

impl ExcelDetails {
    /// Parse the `key\tvalue` table written by the spreadsheet inspection
    /// harness. Returns `None` unless both dimensions are present.
    pub fn from_table(table: &str) -> Option<Self> {
        let mut sheets = Vec::new();
        let mut column_names = Vec::new();
        let mut rows = None;
        let mut columns = None;
        for line in table.lines() {
            let Some((key, value)) = line.split_once('\t') else {
                continue;
            };
            match key {
                "sheet" => sheets.push(value.to_string()),
                "column" => column_names.push(value.to_string()),
                "rows" => rows = value.trim().parse().ok(),
                "columns" => columns = value.trim().parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            sheets,
            rows: rows?,
            columns: columns?,
            column_names,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(flatten)]
    pub entry: FileEntry,
    pub mime_type: String,
    pub staged: Option<StagedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excel: Option<ExcelDetails>,
}

/// Limits applied when staging.
#[derive(Debug, Clone)]
struct StagePolicy {
    max_file_size: u64,
    allowed_extensions: Vec<String>,
}

pub struct Workspace {
    root: PathBuf,
    writable: PathBuf,
    source: MountSource,
    created_at: DateTime<Utc>,
    policy: StagePolicy,
    staged: Mutex<HashMap<String, StagedFile>>,
}

/// Run a directory walk off the async workers.
async fn blocking<T, F>(walk: F) -> Result<T, WorkspaceError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(walk)
        .await
        .map_err(|e| WorkspaceError::Io(std::io::Error::other(e)))
}

fn path_escape(path: &Path, root: &Path) -> WorkspaceError {
    log::error!(
        target: "rbox::security",
        "Path {} escapes workspace root {}",
        path.display(),
        root.display()
    );
    WorkspaceError::PathEscape {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    }
}

impl Workspace {
    /// `root` must already be canonical.
    async fn create(
        root: PathBuf,
        source: MountSource,
        config: &WorkspaceConfig,
    ) -> Result<Self, WorkspaceError> {
        let writable = root.join(&config.writable_area);
        tokio::fs::create_dir_all(&writable).await?;
        let writable_canonical = tokio::fs::canonicalize(&writable).await?;
        if !writable_canonical.starts_with(&root) {
            return Err(path_escape(&writable_canonical, &root));
        }
        if !tokio::fs::metadata(&writable_canonical).await?.is_dir() {
            return Err(WorkspaceError::NotADirectory {
                path: writable_canonical,
            });
        }

        Ok(Self {
            root,
            writable: writable_canonical,
            source,
            created_at: Utc::now(),
            policy: StagePolicy {
                max_file_size: config.max_file_size,
                allowed_extensions: config
                    .allowed_extensions
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_lowercase())
                    .collect(),
            },
            staged: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn writable_dir(&self) -> &Path {
        &self.writable
    }

    pub fn source(&self) -> MountSource {
        self.source
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn binding(&self) -> WorkspaceBinding {
        WorkspaceBinding {
            root: self.root.clone(),
            writable: self.writable.clone(),
        }
    }

    fn ensure_contained(&self, path: &Path) -> Result<(), WorkspaceError> {
        if path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(path_escape(path, &self.root))
        }
    }

    fn lock_staged(&self) -> std::sync::MutexGuard<'_, HashMap<String, StagedFile>> {
        self.staged.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Validate and write `content` into the writable area. The write goes
    /// through a temporary file, so readers never see a partial file.
    ///
    /// With `overwrite` the temporary file is renamed over the target and
    /// concurrent writers to one name race, the last rename winning. Without
    /// it the temporary file is hard-linked into place, which fails if the
    /// name is already taken, and an existing file in the root counts as
    /// taken too.
    pub async fn stage(
        &self,
        name: &str,
        content: &[u8],
        declared_type: Option<&str>,
        overwrite: bool,
    ) -> Result<PathBuf, WorkspaceError> {
        let sanitized = sanitize_name(name)?;
        let extension = names::extension_of(&sanitized);
        if !self.policy.allowed_extensions.contains(&extension) {
            return Err(WorkspaceError::UnsupportedType {
                extension: if extension.is_empty() {
                    "(none)".to_string()
                } else {
                    extension
                },
                allowed: self.policy.allowed_extensions.join(", "),
            });
        }
        let size = content.len() as u64;
        if size > self.policy.max_file_size {
            return Err(WorkspaceError::TooLarge {
                size,
                limit: self.policy.max_file_size,
            });
        }

        let target = self.writable.join(&sanitized);
        self.ensure_contained(&target)?;
        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if meta.is_dir() {
                return Err(WorkspaceError::InvalidName {
                    name: name.to_string(),
                    reason: "a directory with this name exists".to_string(),
                });
            }
            if !overwrite {
                return Err(WorkspaceError::AlreadyExists { name: sanitized });
            }
        }
        if !overwrite && tokio::fs::metadata(self.root.join(&sanitized)).await.is_ok() {
            return Err(WorkspaceError::AlreadyExists { name: sanitized });
        }

        let temp = self
            .writable
            .join(format!(".{}.{}.partial", sanitized, Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&temp, content).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        let placed = if overwrite {
            tokio::fs::rename(&temp, &target).await
        } else {
            let linked = tokio::fs::hard_link(&temp, &target).await;
            let _ = tokio::fs::remove_file(&temp).await;
            linked
        };
        match placed {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists { name: sanitized });
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e.into());
            }
        }

        let canonical = tokio::fs::canonicalize(&target).await?;
        self.ensure_contained(&canonical)?;

        let record = StagedFile {
            size,
            sha256: format!("{:x}", Sha256::digest(content)),
            declared_type: declared_type.map(str::to_string),
            staged_at: Utc::now(),
        };
        log::info!(
            "Staged {} ({} bytes, sha256 {})",
            canonical.display(),
            size,
            record.sha256
        );
        self.lock_staged().insert(sanitized, record);
        Ok(canonical)
    }

    /// Canonical path of a file in the root or the writable area, in that order.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let sanitized = sanitize_name(name)?;
        for dir in [&self.root, &self.writable] {
            let candidate = dir.join(&sanitized);
            let Ok(meta) = tokio::fs::metadata(&candidate).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let canonical = tokio::fs::canonicalize(&candidate).await?;
            self.ensure_contained(&canonical)?;
            return Ok(canonical);
        }

        let listing = self.list(&FileFilter::default());
        let available = blocking(move || listing.all_names()).await?;
        let suggestions = suggest::suggest(&sanitized, available.iter().map(String::as_str));
        Err(WorkspaceError::NotFound {
            name: name.to_string(),
            suggestions,
        })
    }

    pub fn list(&self, filter: &FileFilter) -> FileListing {
        FileListing::new(self.root.clone(), self.writable.clone(), filter)
    }

    /// The listing collected on the blocking pool, most recently modified first.
    pub async fn entries(&self, filter: &FileFilter) -> Result<Vec<FileEntry>, WorkspaceError> {
        let listing = self.list(filter);
        let mut entries: Vec<FileEntry> = blocking(move || listing.iter().collect()).await?;
        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub async fn file_info(&self, name: &str) -> Result<FileInfo, WorkspaceError> {
        let path = self.resolve(name).await?;
        let area = if path.starts_with(&self.writable) {
            FileArea::Workspace
        } else {
            FileArea::Root
        };
        let entry = blocking(move || FileEntry::read(&path, area))
            .await?
            .ok_or_else(|| WorkspaceError::NotFound {
                name: name.to_string(),
                suggestions: vec![],
            })?;
        let staged = if area == FileArea::Workspace {
            self.lock_staged().get(&entry.name).cloned()
        } else {
            None
        };
        Ok(FileInfo {
            mime_type: FileKind::mime_type(&entry.name).to_string(),
            entry,
            staged,
            excel: None,
        })
    }

    async fn mount_info(&self) -> Result<MountInfo, WorkspaceError> {
        let entries = self.entries(&FileFilter::default()).await?;
        Ok(MountInfo {
            root: self.root.clone(),
            writable_area: self.writable.clone(),
            sample: entries
                .iter()
                .take(MOUNT_SAMPLE_SIZE)
                .map(|e| e.name.clone())
                .collect(),
            total_entries: entries.len(),
        })
    }
}

/// Owns the workspace of every live session.
pub struct WorkspaceManager {
    config: WorkspaceConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Workspace>>>,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session: &SessionId) -> Option<Arc<Workspace>> {
        self.sessions.read().await.get(session).cloned()
    }

    /// The session's workspace, creating an upload workspace on first use.
    pub async fn open(&self, session: &SessionId) -> Result<Arc<Workspace>, WorkspaceError> {
        if let Some(ws) = self.get(session).await {
            return Ok(ws);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(ws) = sessions.get(session) {
            return Ok(ws.clone());
        }

        tokio::fs::create_dir_all(&self.config.root_dir).await?;
        let parent = tokio::fs::canonicalize(&self.config.root_dir).await?;
        let root = parent.join(format!("session-{}", Uuid::new_v4()));
        tokio::fs::create_dir(&root).await?;
        let workspace =
            Arc::new(Workspace::create(root, MountSource::Uploaded, &self.config).await?);
        log::info!(
            "Created workspace {} for session {}",
            workspace.root().display(),
            session
        );
        sessions.insert(session.clone(), workspace.clone());
        Ok(workspace)
    }

    /// Bind the session to an existing host directory. A previous upload
    /// workspace of the session is destroyed.
    pub async fn mount(
        &self,
        session: &SessionId,
        host_dir: &Path,
    ) -> Result<MountInfo, WorkspaceError> {
        if !host_dir.is_absolute() {
            return Err(WorkspaceError::InvalidName {
                name: host_dir.display().to_string(),
                reason: "mount path must be absolute".to_string(),
            });
        }
        let meta = match tokio::fs::metadata(host_dir).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound {
                    name: host_dir.display().to_string(),
                    suggestions: vec![],
                })
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(WorkspaceError::NotADirectory {
                path: host_dir.to_path_buf(),
            });
        }

        let root = tokio::fs::canonicalize(host_dir).await?;
        let workspace = Arc::new(
            Workspace::create(root, MountSource::HostDirectory, &self.config).await?,
        );
        let info = workspace.mount_info().await?;
        log::info!(
            "Mounted {} for session {} ({} entries)",
            info.root.display(),
            session,
            info.total_entries
        );

        let previous = self
            .sessions
            .write()
            .await
            .insert(session.clone(), workspace);
        if let Some(previous) = previous {
            Self::dispose(&previous).await;
        }
        Ok(info)
    }

    /// Forget the session. Upload workspaces are deleted; mounted host
    /// directories are left in place.
    pub async fn close(&self, session: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(session);
        match removed {
            Some(ws) => {
                Self::dispose(&ws).await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<Workspace>> =
            self.sessions.write().await.drain().map(|(_, ws)| ws).collect();
        for ws in drained {
            Self::dispose(&ws).await;
        }
    }

    async fn dispose(workspace: &Workspace) {
        if workspace.source() != MountSource::Uploaded {
            log::info!("Unbound host directory {}", workspace.root().display());
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(workspace.root()).await {
            log::warn!(
                "Failed to remove workspace {}: {}",
                workspace.root().display(),
                e
            );
        } else {
            log::info!("Removed workspace {}", workspace.root().display());
        }
    }
}
