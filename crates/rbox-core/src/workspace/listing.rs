use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::names::extension_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Excel,
    Csv,
    Text,
    Json,
    Other,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        match extension_of(name).as_str() {
            "xlsx" | "xls" => FileKind::Excel,
            "csv" | "tsv" => FileKind::Csv,
            "txt" => FileKind::Text,
            "json" => FileKind::Json,
            _ => FileKind::Other,
        }
    }

    pub fn mime_type(name: &str) -> &'static str {
        match extension_of(name).as_str() {
            "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "xls" => "application/vnd.ms-excel",
            "csv" => "text/csv",
            "tsv" => "text/tab-separated-values",
            "txt" => "text/plain",
            "json" => "application/json",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "pdf" => "application/pdf",
            "svg" => "image/svg+xml",
            "r" => "text/x-r",
            _ => "application/octet-stream",
        }
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "excel" => Ok(FileKind::Excel),
            "csv" => Ok(FileKind::Csv),
            "text" => Ok(FileKind::Text),
            "json" => Ok(FileKind::Json),
            "other" => Ok(FileKind::Other),
            other => Err(format!(
                "unknown file kind '{}', expected excel, csv, text, json or other",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileArea {
    Root,
    Workspace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: FileKind,
    pub area: FileArea,
}

impl FileEntry {
    pub(crate) fn read(path: &Path, area: FileArea) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self {
            kind: FileKind::from_name(&name),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            size: meta.len(),
            path: path.to_path_buf(),
            area,
            name,
        })
    }
}

/// Optional kind and glob (`*`, `?`) restrictions for a listing.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub kind: Option<FileKind>,
    pub pattern: Option<String>,
}

impl FileFilter {
    pub fn kind(kind: FileKind) -> Self {
        Self {
            kind: Some(kind),
            pattern: None,
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            kind: None,
            pattern: Some(pattern.into()),
        }
    }
}

/// Case-insensitive, whole-name glob match.
pub fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(glob.len() + 8);
    expr.push('^');
    for c in glob.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    RegexBuilder::new(&expr).case_insensitive(true).build().ok()
}

/// Files visible in a workspace, read lazily from disk on each `iter` call.
///
/// The writable area is walked first and its names shadow same-named files
/// in the root. Entries whose canonical path leaves the root are skipped.
#[derive(Debug, Clone)]
pub struct FileListing {
    root: PathBuf,
    writable: PathBuf,
    kind: Option<FileKind>,
    pattern: Option<Regex>,
}

impl FileListing {
    pub(crate) fn new(root: PathBuf, writable: PathBuf, filter: &FileFilter) -> Self {
        Self {
            root,
            writable,
            kind: filter.kind,
            pattern: filter.pattern.as_deref().and_then(glob_to_regex),
        }
    }

    /// Every visible name, ignoring the filter.
    pub(crate) fn all_names(&self) -> Vec<String> {
        FileListing {
            root: self.root.clone(),
            writable: self.writable.clone(),
            kind: None,
            pattern: None,
        }
        .iter()
        .map(|e| e.name)
        .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = FileEntry> + '_ {
        let mut seen = HashSet::new();
        let areas = [
            (self.writable.as_path(), FileArea::Workspace),
            (self.root.as_path(), FileArea::Root),
        ];
        areas
            .into_iter()
            .flat_map(|(dir, area)| {
                fs::read_dir(dir)
                    .into_iter()
                    .flatten()
                    .filter_map(Result::ok)
                    .map(move |entry| (entry.path(), area))
            })
            .filter(|(path, _)| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
            .filter(|(path, _)| {
                fs::canonicalize(path).is_ok_and(|canonical| canonical.starts_with(&self.root))
            })
            .filter_map(|(path, area)| FileEntry::read(&path, area))
            .filter(move |entry| seen.insert(entry.name.clone()))
            .filter(|entry| self.kind.map_or(true, |k| k == entry.kind))
            .filter(|entry| {
                self.pattern
                    .as_ref()
                    .map_or(true, |p| p.is_match(&entry.name))
            })
    }
}
