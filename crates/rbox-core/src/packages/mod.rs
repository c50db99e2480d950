//! Package resolver
//!
//! Tracks which optional R packages are present in the shared library and
//! installs missing ones on demand. Installs run in dedicated maintenance
//! environments. Concurrent requests for the same package share one install
//! and all of them observe its outcome.

pub mod version;

pub use version::{validate_package_name, validate_repository, RVersion, VersionConstraint};

use crate::errors::{EnvironmentError, PackageError};
use crate::executors::ExecutionController;
use crate::script::{Marker, MarkerStatus, ScriptBuilder};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InstalledPackage {
    version: String,
    title: Option<String>,
}

impl InstalledPackage {
    fn describe(&self, name: &str) -> PackageDescriptor {
        PackageDescriptor {
            name: name.to_string(),
            version: self.version.clone(),
            title: self.title.clone(),
        }
    }
}

/// Installed packages by name, as last read from the library.
#[derive(Debug, Clone, Default)]
pub struct InstalledPackageSet {
    packages: BTreeMap<String, InstalledPackage>,
}

impl InstalledPackageSet {
    /// Parse `name\tversion[\ttitle]` lines; malformed lines are skipped.
    pub fn from_listing(listing: &str) -> Self {
        let packages = listing
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let name = fields.next()?.trim();
                let version = fields.next()?.trim();
                let title = fields
                    .next()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                (!name.is_empty() && !version.is_empty()).then(|| {
                    (
                        name.to_string(),
                        InstalledPackage {
                            version: version.to_string(),
                            title,
                        },
                    )
                })
            })
            .collect();
        Self { packages }
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.packages.get(name).map(|p| p.version.as_str())
    }

    pub fn title_of(&self, name: &str) -> Option<&str> {
        self.packages.get(name).and_then(|p| p.title.as_deref())
    }

    /// Record an install. A previously listed title is kept.
    pub fn insert(&mut self, name: &str, version: &str) {
        let title = self.packages.get(name).and_then(|p| p.title.clone());
        self.packages.insert(
            name.to_string(),
            InstalledPackage {
                version: version.to_string(),
                title,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    fn satisfies(&self, name: &str, constraint: Option<&VersionConstraint>) -> Option<PackageDescriptor> {
        let package = self.packages.get(name)?;
        let ok = match constraint {
            None => true,
            Some(c) => package
                .version
                .parse::<RVersion>()
                .map(|v| c.is_satisfied_by(&v))
                .unwrap_or(false),
        };
        ok.then(|| package.describe(name))
    }
}

/// Snapshot of installed packages matching a filter. `iter` can be called
/// any number of times and always yields the same sequence.
#[derive(Debug, Clone)]
pub struct PackageListing {
    snapshot: Arc<InstalledPackageSet>,
    pattern: Option<Regex>,
}

impl PackageListing {
    pub fn iter(&self) -> impl Iterator<Item = PackageDescriptor> + '_ {
        self.snapshot
            .packages
            .iter()
            .filter(move |(name, _)| self.pattern.as_ref().map_or(true, |p| p.is_match(name)))
            .map(|(name, package)| package.describe(name))
    }
}

/// Case-insensitive regex; falls back to a literal match when `pattern` is
/// not a valid expression.
fn package_pattern(pattern: &str) -> Option<Regex> {
    let build = |p: &str| RegexBuilder::new(p).case_insensitive(true).build();
    build(pattern)
        .or_else(|_| build(&regex::escape(pattern)))
        .ok()
}

type InstallCell = Arc<OnceCell<Result<PackageDescriptor, PackageError>>>;

pub struct PackageResolver {
    controller: Arc<ExecutionController>,
    scripts: ScriptBuilder,
    install_timeout: Duration,
    max_diagnostic_len: usize,
    installed: RwLock<Option<Arc<InstalledPackageSet>>>,
    in_flight: Mutex<HashMap<String, InstallCell>>,
}

impl PackageResolver {
    pub fn new(
        controller: Arc<ExecutionController>,
        scripts: ScriptBuilder,
        repository: &str,
        install_timeout: Duration,
        max_diagnostic_len: usize,
    ) -> Result<Self, PackageError> {
        validate_repository(repository)?;
        Ok(Self {
            controller,
            scripts,
            install_timeout,
            max_diagnostic_len,
            installed: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Make sure `name` is installed and satisfies `constraint`. With `force`
    /// the package is reinstalled even when already present. `repository`
    /// replaces the configured repository for an install this call starts;
    /// callers joining an install already in flight share its repository.
    pub async fn ensure_installed(
        &self,
        name: &str,
        constraint: Option<&str>,
        force: bool,
        repository: Option<&str>,
    ) -> Result<PackageDescriptor, PackageError> {
        validate_package_name(name)?;
        let repository = repository.map(str::trim).filter(|r| !r.is_empty());
        if let Some(repo) = repository {
            validate_repository(repo)?;
        }
        let constraint = constraint
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::parse::<VersionConstraint>)
            .transpose()?;

        if !force {
            let installed = self.installed_set().await?;
            if let Some(found) = installed.satisfies(name, constraint.as_ref()) {
                log::debug!("Package {} {} already installed", found.name, found.version);
                return Ok(found);
            }
        }

        // A shared install may have been started for a different constraint;
        // in that case go round again once it has finished.
        for _ in 0..3 {
            let cell = self.install_cell(name);
            let outcome = cell
                .get_or_init(|| {
                    self.install_unless_present(name, constraint.as_ref(), force, repository)
                })
                .await
                .clone();
            self.forget_cell(name, &cell);

            let descriptor = outcome?;
            let satisfied = match &constraint {
                None => true,
                Some(c) => descriptor
                    .version
                    .parse::<RVersion>()
                    .map(|v| c.is_satisfied_by(&v))
                    .unwrap_or(false),
            };
            if satisfied {
                return Ok(descriptor);
            }
        }

        Err(PackageError::InstallFailed {
            package: name.to_string(),
            reason: "concurrent installs with conflicting version constraints".to_string(),
        })
    }

    /// Installed packages whose names match `pattern` (case-insensitive).
    pub async fn list(&self, pattern: Option<&str>) -> Result<PackageListing, PackageError> {
        let snapshot = self.installed_set().await?;
        Ok(PackageListing {
            snapshot,
            pattern: pattern.filter(|p| !p.is_empty()).and_then(package_pattern),
        })
    }

    fn install_cell(&self, name: &str) -> InstallCell {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn forget_cell(&self, name: &str, cell: &InstallCell) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if in_flight.get(name).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            in_flight.remove(name);
        }
    }

    async fn installed_set(&self) -> Result<Arc<InstalledPackageSet>, PackageError> {
        if let Some(set) = self.installed.read().await.as_ref() {
            return Ok(set.clone());
        }

        let mut guard = self.installed.write().await;
        if let Some(set) = guard.as_ref() {
            return Ok(set.clone());
        }

        log::debug!("Reading installed package set");
        let script = self.scripts.list_packages_script();
        let outcome = self
            .controller
            .run_maintenance(&script, self.install_timeout)
            .await
            .map_err(|e| PackageError::QueryFailed(e.to_string()))?;

        let marker = outcome.marker.as_deref().and_then(|m| Marker::parse(m).ok());
        match marker {
            Some(m) if m.status == MarkerStatus::Ok => {}
            Some(m) => return Err(PackageError::QueryFailed(self.bounded(&m.message))),
            None => {
                return Err(PackageError::QueryFailed(self.bounded(&format!(
                    "package listing exited with status {}: {}",
                    outcome.exit_code, outcome.stderr
                ))))
            }
        }

        let listing = outcome
            .primary_output
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let set = Arc::new(InstalledPackageSet::from_listing(&listing));
        log::info!("Package library holds {} packages", set.len());
        *guard = Some(set.clone());
        Ok(set)
    }

    async fn install_unless_present(
        &self,
        name: &str,
        constraint: Option<&VersionConstraint>,
        force: bool,
        repository: Option<&str>,
    ) -> Result<PackageDescriptor, PackageError> {
        // an install that finished just before this one started may already cover it
        if !force {
            if let Some(set) = self.installed.read().await.as_ref() {
                if let Some(found) = set.satisfies(name, constraint) {
                    return Ok(found);
                }
            }
        }
        self.install(name, constraint, repository).await
    }

    async fn install(
        &self,
        name: &str,
        constraint: Option<&VersionConstraint>,
        repository: Option<&str>,
    ) -> Result<PackageDescriptor, PackageError> {
        let pinned = constraint.and_then(|c| c.pinned()).map(|v| v.as_str());
        log::info!(
            "Installing R package {}{}{}",
            name,
            constraint.map(|c| format!(" ({})", c)).unwrap_or_default(),
            repository.map(|r| format!(" from {}", r)).unwrap_or_default()
        );

        let script = self.scripts.install_script(name, pinned, repository);
        let failed = |reason: String| PackageError::InstallFailed {
            package: name.to_string(),
            reason: self.bounded(&reason),
        };

        let outcome = match self
            .controller
            .run_maintenance(&script, self.install_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(EnvironmentError::Timeout(budget)) => {
                return Err(failed(format!(
                    "installation timed out after {}s",
                    budget.as_secs()
                )))
            }
            Err(e) => return Err(failed(e.to_string())),
        };

        let marker = outcome.marker.as_deref().and_then(|m| Marker::parse(m).ok());
        let version = match marker {
            Some(m) if m.status == MarkerStatus::Ok => m.message.trim().to_string(),
            Some(m) => {
                log::warn!("Installation of {} failed: {}", name, m.message);
                return Err(failed(m.message));
            }
            None => {
                return Err(failed(format!(
                    "installer exited with status {}: {}",
                    outcome.exit_code, outcome.stderr
                )))
            }
        };

        if let Some(c) = constraint {
            let satisfied = version
                .parse::<RVersion>()
                .map(|v| c.is_satisfied_by(&v))
                .unwrap_or(false);
            if !satisfied {
                return Err(failed(format!(
                    "installed version {} does not satisfy {}",
                    version, c
                )));
            }
        }

        let title = {
            let mut guard = self.installed.write().await;
            match guard.as_mut() {
                Some(set) => {
                    let set = Arc::make_mut(set);
                    set.insert(name, &version);
                    set.title_of(name).map(str::to_string)
                }
                None => None,
            }
        };
        log::info!("Installed R package {} {}", name, version);

        Ok(PackageDescriptor {
            name: name.to_string(),
            version,
            title,
        })
    }

    fn bounded(&self, text: &str) -> String {
        crate::extract::truncate_text(text.trim(), self.max_diagnostic_len)
    }
}
