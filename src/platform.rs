//! Host platform detection: `/etc/os-release` and the archive prefix.
//!
//! Builds for different OS releases and CPU families never share artifacts;
//! each combination gets its own prefix, e.g. `amzn-2023_graviton-3`.

use std::fs;
use std::path::Path;

/// OS package family, which picks the package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    RedHat,
}

impl OsFamily {
    pub fn package_manager(self) -> &'static str {
        match self {
            Self::Debian => "apt",
            Self::RedHat => "dnf",
        }
    }

    /// Suffix of development packages on this family.
    pub fn dev_suffix(self) -> &'static str {
        match self {
            Self::Debian => "-dev",
            Self::RedHat => "-devel",
        }
    }
}

/// The fields of `/etc/os-release` we use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub id_like: Option<String>,
}

impl OsRelease {
    pub fn load() -> Option<Self> {
        Self::load_from(Path::new("/etc/os-release"))
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        fs::read_to_string(path).ok().map(|s| Self::parse(&s))
    }

    pub fn parse(text: &str) -> Self {
        let mut release = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "ID" => release.id = value,
                "VERSION_ID" => release.version_id = value,
                "ID_LIKE" => release.id_like = Some(value),
                _ => {}
            }
        }
        release
    }

    /// `<id>-<version>` with Rocky folded into RHEL, and RHEL reduced to
    /// its major version. `None` when either field is missing.
    pub fn tag(&self) -> Option<String> {
        if self.id.is_empty() || self.version_id.is_empty() {
            return None;
        }
        let id = if self.id == "rocky" { "rhel" } else { &self.id };
        let version = if id == "rhel" {
            self.version_id.split('.').next().unwrap_or(&self.version_id)
        } else {
            &self.version_id
        };
        Some(format!("{id}-{version}"))
    }

    /// Package family from the first `ID_LIKE` entry, else `ID`.
    pub fn family(&self) -> Option<OsFamily> {
        let like = self
            .id_like
            .as_deref()
            .and_then(|l| l.split_whitespace().next())
            .unwrap_or(&self.id);
        match like {
            "debian" | "ubuntu" => Some(OsFamily::Debian),
            "fedora" | "centos" | "redhat" | "rhel" => Some(OsFamily::RedHat),
            _ => None,
        }
    }
}

/// `<os_id>-<version_id>_<cpu_type>[_<gpu_type>]`
pub fn platform_prefix(release: &OsRelease, cpu_type: &str, gpu_type: Option<&str>) -> Option<String> {
    let mut prefix = format!("{}_{cpu_type}", release.tag()?);
    if let Some(gpu) = gpu_type {
        prefix.push('_');
        prefix.push_str(gpu);
    }
    Some(prefix)
}
