//! Minimum-toolchain policy.
//!
//! Pure functions over a name -> minimum version table. Anything built with
//! a toolchain missing from the table, or older than its minimum, is skipped.

use std::collections::BTreeMap;
use std::fmt;

use crate::model::{PackageSpec, ToolchainRef};
use crate::version::Version;

/// Whether a package may be built under the current policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Ok,
    Skip(String),
}

impl Eligibility {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Skip(reason) => f.write_str(reason),
        }
    }
}

/// Toolchain name to minimum supported version.
#[derive(Debug, Clone)]
pub struct ToolchainPolicy {
    minimums: BTreeMap<String, Version>,
}

impl ToolchainPolicy {
    pub fn new(table: &BTreeMap<String, String>) -> Self {
        Self {
            minimums: table
                .iter()
                .map(|(name, version)| (name.clone(), Version::parse(version)))
                .collect(),
        }
    }

    /// Whether `name` is itself a tracked toolchain.
    pub fn tracks(&self, name: &str) -> bool {
        self.minimums.contains_key(name)
    }

    fn below_minimum(&self, name: &str, version: &str) -> bool {
        self.minimums
            .get(name)
            .is_some_and(|min| Version::parse(version) < *min)
    }

    /// Check a package and the toolchain it is built with.
    ///
    /// Order matters: a too-old toolchain package is reported before its
    /// own toolchain is looked at.
    pub fn is_eligible(
        &self,
        name: &str,
        version: &str,
        toolchain_name: &str,
        toolchain_version: &str,
    ) -> Eligibility {
        if self.below_minimum(name, version) {
            return Eligibility::Skip(format!("toolchain version too old: {version}"));
        }
        if !self.tracks(toolchain_name) {
            return Eligibility::Skip(format!("toolchain not supported: {toolchain_name}"));
        }
        if self.below_minimum(toolchain_name, toolchain_version) {
            return Eligibility::Skip(format!(
                "toolchain version too old: {toolchain_name}-{toolchain_version}"
            ));
        }
        Eligibility::Ok
    }

    /// Check a parsed recipe.
    pub fn check_spec(&self, spec: &PackageSpec) -> Eligibility {
        self.is_eligible(
            &spec.name,
            &spec.version,
            &spec.toolchain.name,
            &spec.toolchain.version,
        )
    }

    /// Check only a toolchain reference.
    pub fn check_toolchain(&self, toolchain: &ToolchainRef) -> Eligibility {
        self.is_eligible("", "", &toolchain.name, &toolchain.version)
    }

    /// Whether a missing module (`name/version`, or a bare `name` read as
    /// version `0.0`) is a tracked toolchain older than its minimum.
    pub fn dependency_too_old(&self, module: &str) -> bool {
        let (name, version) = module.split_once('/').unwrap_or((module, "0.0"));
        self.below_minimum(name, version)
    }
}
