//! OS package prerequisites of recipes.
//!
//! Best effort: a package that fails to install is logged and the build
//! goes ahead; the toolchain reports anything that is really missing.

use std::collections::HashSet;
use std::process::Command;

use crate::platform::OsFamily;

/// Installs one OS package, returning whether it succeeded.
pub trait PackageInstaller {
    fn install(&self, package: &str) -> bool;
}

/// `sudo apt|dnf install -y <package>`.
pub struct SystemInstaller {
    family: OsFamily,
}

impl SystemInstaller {
    pub fn new(family: OsFamily) -> Self {
        Self { family }
    }
}

impl PackageInstaller for SystemInstaller {
    fn install(&self, package: &str) -> bool {
        let manager = self.family.package_manager();
        tracing::info!(package, manager, "installing OS package");
        match Command::new("sudo")
            .args([manager, "install", "-y", package])
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::warn!(package, error = %e, "could not run package manager");
                false
            }
        }
    }
}

/// Install each entry, trying its alternatives until one succeeds.
///
/// Alternatives ending in the family's development suffix are tried first.
/// Names already in `installed` are not retried; names that install
/// successfully are added to it.
pub fn install_os_packages(
    installer: &dyn PackageInstaller,
    family: OsFamily,
    entries: &[Vec<String>],
    installed: &mut HashSet<String>,
) {
    for alternatives in entries {
        if alternatives.iter().any(|p| installed.contains(p)) {
            tracing::debug!(packages = ?alternatives, "already installed");
            continue;
        }

        let (preferred, rest): (Vec<&String>, Vec<&String>) = alternatives
            .iter()
            .partition(|p| p.ends_with(family.dev_suffix()));

        let done = preferred
            .into_iter()
            .chain(rest)
            .find(|p| installer.install(p));

        match done {
            Some(package) => {
                installed.insert(package.clone());
            }
            None => tracing::warn!(packages = ?alternatives, "no alternative installed"),
        }
    }
}
