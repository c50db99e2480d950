use crate::errors::PackageError;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9.]*[A-Za-z0-9]$").expect("package name pattern is valid")
    })
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9]+([.-][0-9]+)*$").expect("version pattern is valid"))
}

fn repository_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://[A-Za-z0-9.-]+(:[0-9]+)?(/[A-Za-z0-9._~/-]*)?$")
            .expect("repository pattern is valid")
    })
}

/// R package names: a letter first, then letters, digits and dots, not
/// ending in a dot.
pub fn validate_package_name(name: &str) -> Result<(), PackageError> {
    if name.len() > 128 || !name_pattern().is_match(name) {
        return Err(PackageError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn validate_repository(url: &str) -> Result<(), PackageError> {
    if !repository_pattern().is_match(url) {
        return Err(PackageError::InvalidRepository(url.to_string()));
    }
    Ok(())
}

/// An R package version such as `1.2.3` or `0.4-1`. Components are compared
/// numerically, so `1.10` is newer than `1.9`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RVersion {
    raw: String,
    parts: Vec<u64>,
}

impl RVersion {
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for RVersion {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !version_pattern().is_match(s) {
            return Err(PackageError::InvalidConstraint(s.to_string()));
        }
        let parts = s
            .split(['.', '-'])
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| PackageError::InvalidConstraint(s.to_string()))?;
        Ok(Self {
            raw: s.to_string(),
            parts,
        })
    }
}

impl Ord for RVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for RVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `1.2.3` and `==1.2.3` pin a version, `>=1.2` sets a floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    Exact(RVersion),
    AtLeast(RVersion),
}

impl VersionConstraint {
    pub fn is_satisfied_by(&self, installed: &RVersion) -> bool {
        match self {
            VersionConstraint::Exact(v) => installed.cmp(v) == Ordering::Equal,
            VersionConstraint::AtLeast(v) => installed >= v,
        }
    }

    /// Version to ask the installer for, when the constraint pins one.
    pub fn pinned(&self) -> Option<&RVersion> {
        match self {
            VersionConstraint::Exact(v) => Some(v),
            VersionConstraint::AtLeast(_) => None,
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PackageError::InvalidConstraint(s.to_string());
        if let Some(rest) = s.strip_prefix(">=") {
            Ok(VersionConstraint::AtLeast(rest.parse().map_err(|_| invalid())?))
        } else if let Some(rest) = s.strip_prefix("==") {
            Ok(VersionConstraint::Exact(rest.parse().map_err(|_| invalid())?))
        } else {
            Ok(VersionConstraint::Exact(s.parse().map_err(|_| invalid())?))
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Exact(v) => write!(f, "=={}", v),
            VersionConstraint::AtLeast(v) => write!(f, ">={}", v),
        }
    }
}
