//! Fake isolation backend for driving the engine without R or Docker.
//!
//! It inspects the generated harness to decide what kind of run it is and
//! writes the marker and outputs a real harness would have produced.

#![allow(dead_code)]

use async_trait::async_trait;
use rbox_core::config::RboxConfig;
use rbox_core::executors::{EnvironmentHandle, IsolationBackend, ProvisionSpec, RawOutput};
use rbox_core::EnvironmentError;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
pub struct FakeBackend {
    pub provisioned: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
    pub executed_in: Mutex<Vec<String>>,
    pub installs: AtomicUsize,
    pub installed: Mutex<BTreeMap<String, String>>,
    pub failing_packages: Mutex<HashSet<String>>,
    pub repositories: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn with_packages(packages: &[(&str, &str)]) -> Self {
        let backend = Self::default();
        {
            let mut installed = backend.installed.lock().unwrap();
            for (name, version) in packages {
                installed.insert(name.to_string(), version.to_string());
            }
        }
        backend
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn executed_in(&self) -> Vec<String> {
        self.executed_in.lock().unwrap().clone()
    }

    pub fn repositories(&self) -> Vec<String> {
        self.repositories.lock().unwrap().clone()
    }

    fn marker(dir: &Path, status: &str, message: &str, output: &str) {
        let marker = serde_json::json!({
            "status": status,
            "message": message,
            "output": output,
        });
        std::fs::write(dir.join("marker.json"), marker.to_string()).unwrap();
    }

    async fn install(&self, dir: &Path, harness: &str) -> RawOutput {
        let name = Regex::new(r#"pkg <- "([^"]+)""#)
            .unwrap()
            .captures(harness)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let version = Regex::new(r#"install_version\(pkg, version = "([^"]+)""#)
            .unwrap()
            .captures(harness)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "1.0.0".to_string());

        if let Some(caps) = Regex::new(r#"options\(repos = c\(CRAN = "([^"]+)"\)\)"#)
            .unwrap()
            .captures(harness)
        {
            self.repositories.lock().unwrap().push(caps[1].to_string());
        }

        self.installs.fetch_add(1, Ordering::SeqCst);
        // long enough for concurrent callers to pile up on the same install
        tokio::time::sleep(Duration::from_millis(200)).await;

        if self.failing_packages.lock().unwrap().contains(&name) {
            Self::marker(
                dir,
                "caller_error",
                &format!("package '{}' is not available for this version of R", name),
                "none",
            );
            return RawOutput {
                exit_code: 1,
                ..Default::default()
            };
        }

        self.installed.lock().unwrap().insert(name, version.clone());
        Self::marker(dir, "ok", &version, "none");
        RawOutput::default()
    }

    fn list(&self, dir: &Path) -> RawOutput {
        let table: String = self
            .installed
            .lock()
            .unwrap()
            .iter()
            .map(|(name, version)| format!("{}\t{}\tThe {} package\n", name, version, name))
            .collect();
        std::fs::write(dir.join("packages.tsv"), table).unwrap();
        Self::marker(dir, "ok", "", "produced");
        RawOutput::default()
    }

    /// Spreadsheet inspection: names containing "broken" fail to parse.
    fn excel(&self, dir: &Path, harness: &str) -> RawOutput {
        let target = Regex::new(r#"target <- "([^"]+)""#)
            .unwrap()
            .captures(harness)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        if target.contains("broken") {
            Self::marker(dir, "caller_error", "zip file is corrupt", "none");
            return RawOutput {
                exit_code: 1,
                ..Default::default()
            };
        }
        std::fs::write(
            dir.join("excel.tsv"),
            "sheet\tSheet1\nsheet\tTotals\nrows\t3\ncolumns\t2\ncolumn\tregion\ncolumn\tsales\n",
        )
        .unwrap();
        Self::marker(dir, "ok", "", "produced");
        RawOutput::default()
    }

    async fn caller_run(&self, dir: &Path, harness: &str) -> RawOutput {
        let code = std::fs::read_to_string(dir.join("user_code.R")).unwrap_or_default();

        if code.contains("Sys.sleep") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }

        if let Some(caps) = Regex::new(r#"stop\("([^"]*)"\)"#).unwrap().captures(&code) {
            Self::marker(dir, "caller_error", &caps[1], "none");
            return RawOutput {
                exit_code: 1,
                stderr: format!("Error: {}", &caps[1]),
                ..Default::default()
            };
        }

        let device = Regex::new(r"png\(filename = primary, width = (\d+), height = (\d+)")
            .unwrap()
            .captures(harness)
            .map(|c| (c[1].parse::<u32>().unwrap(), c[2].parse::<u32>().unwrap()));
        if let Some((width, height)) = device {
            std::fs::write(dir.join("output.png"), png_header(width, height)).unwrap();
            Self::marker(dir, "ok", "", "produced");
            return RawOutput::default();
        }

        if code.trim() == "1+1" {
            std::fs::write(dir.join("output.txt"), "[1] 2\n").unwrap();
            Self::marker(dir, "ok", "", "produced");
        } else {
            Self::marker(dir, "ok", "", "none");
        }
        RawOutput::default()
    }
}

pub fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<EnvironmentHandle, EnvironmentError> {
        let id = format!("fake-{}", spec.id);
        self.provisioned.lock().unwrap().push(id.clone());
        Ok(EnvironmentHandle {
            backend_id: id,
            working_dir: spec.run_dir.display().to_string(),
            env: vec![],
        })
    }

    async fn exec(
        &self,
        handle: &EnvironmentHandle,
        _command: &[String],
        _max_output_bytes: usize,
    ) -> Result<RawOutput, EnvironmentError> {
        self.executed_in
            .lock()
            .unwrap()
            .push(handle.backend_id.clone());
        let dir = PathBuf::from(&handle.working_dir);
        let harness = std::fs::read_to_string(dir.join("script.R"))?;

        let output = if harness.contains("readxl::excel_sheets") {
            self.excel(&dir, &harness)
        } else if harness.contains("installed.packages") {
            self.list(&dir)
        } else if harness.contains("pkg <- ") {
            self.install(&dir, &harness).await
        } else {
            self.caller_run(&dir, &harness).await
        };
        Ok(output)
    }

    async fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        self.destroyed
            .lock()
            .unwrap()
            .push(handle.backend_id.clone());
        Ok(())
    }
}

/// Configuration rooted in scratch directories, with the scratch guard.
pub fn test_config() -> (RboxConfig, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();
    let scratch = tempfile::tempdir().unwrap();
    let mut config = RboxConfig::default();
    config.workspace.root_dir = scratch.path().join("workspaces");
    config.packages.library_dir = scratch.path().join("library");
    config.execution.pool_size = 2;
    config.execution.checkout_timeout_secs = 5;
    (config, scratch)
}
