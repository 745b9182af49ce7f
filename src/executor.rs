//! Building a planned recipe: its missing dependencies first, in order,
//! then the recipe itself.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive;
use crate::catalog::RecipeCatalog;
use crate::model::{BuildStatusRecord, MissingModules, PackageSpec};
use crate::osdeps::{self, PackageInstaller};
use crate::platform::OsFamily;
use crate::status::{self, StatusStore};
use crate::toolchain::{BuildMode, BuildOutcome, Toolchain};

pub const BUILT_REASON: &str = "easyconfig built successfully";

/// OS package installation for recipe prerequisites.
pub struct OsPackages<'a> {
    pub installer: &'a dyn PackageInstaller,
    pub family: OsFamily,
}

/// What one execution did, for the running tally.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Execution {
    /// Builds that produced something: dependencies that succeeded, plus
    /// the target when it left new archives behind.
    pub built: usize,
    /// Recipe filenames whose build failed.
    pub failed: Vec<String>,
    /// Archives written after the target succeeded.
    pub new_archives: Vec<PathBuf>,
}

pub struct BuildExecutor<'a> {
    pub toolchain: &'a dyn Toolchain,
    pub status: &'a StatusStore<'a>,
    pub catalog: &'a RecipeCatalog<'a>,
    pub os_packages: Option<OsPackages<'a>>,
    pub eb_root: PathBuf,
}

impl BuildExecutor<'_> {
    /// Build the missing dependencies, then the target at `recipe_path`.
    ///
    /// A failing dependency aborts the chain and leaves the target record
    /// untouched. Status store errors abort the execution.
    pub fn execute(
        &self,
        recipe_path: &Path,
        spec: &PackageSpec,
        missing: &MissingModules,
        installed: &mut HashSet<String>,
    ) -> status::Result<Execution> {
        let mut execution = Execution::default();
        let recipe = file_name(recipe_path);

        self.install_os_packages(&spec.os_dependencies, installed);

        for dep in missing.dependencies() {
            let _span = tracing::info_span!("dependency", recipe = %dep.recipe).entered();

            let dep_path = match self.catalog.locate(&dep.recipe) {
                Ok(path) => {
                    match self.catalog.describe(&path) {
                        Ok(dep_spec) => self.install_os_packages(&dep_spec.os_dependencies, installed),
                        Err(e) => tracing::warn!(error = %e, "could not read dependency recipe"),
                    }
                    path
                }
                Err(_) => PathBuf::from(&dep.recipe),
            };

            let outcome = self.build(&dep_path, BuildMode::Permissive);
            self.status.update(&dep.recipe, |r| {
                record_attempt(r, outcome);
                if outcome.success() {
                    r.mark_success(BUILT_REASON);
                } else {
                    r.mark_error();
                }
            })?;

            if outcome.success() {
                tracing::info!("dependency built");
                execution.built += 1;
            } else {
                tracing::warn!(returncode = outcome.returncode, "dependency failed, abandoning chain");
                self.keep_failed_log(&dep.recipe);
                execution.failed.push(dep.recipe.clone());
                return Ok(execution);
            }
        }

        let outcome = self.build(recipe_path, BuildMode::Strict);
        if outcome.success() {
            self.status.update(&recipe, |r| {
                record_attempt(r, outcome);
                r.mark_success(BUILT_REASON);
            })?;
            let software = self.eb_root.join("software");
            let install_dir = spec.install_dir();
            if software.join(&install_dir).is_dir() {
                tracing::info!(install = %install_dir, "recipe built");
            } else {
                tracing::warn!(install = %install_dir, "recipe built but install directory is missing");
            }

            let report = archive::archive_software(&software);
            for tarball in &report.failed {
                tracing::warn!(tarball = %tarball.display(), "install left unarchived");
            }
            tracing::info!(
                archives = report.all.len(),
                new = report.new.len(),
                failed = report.failed.len(),
                "archiving done"
            );
            if !report.new.is_empty() {
                execution.built += 1;
            }
            execution.new_archives = report.new;
        } else {
            tracing::warn!(returncode = outcome.returncode, "recipe failed");
            self.keep_failed_log(&recipe);
            let still_missing = match self.toolchain.missing_modules(recipe_path) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(error = %e, "could not re-check missing modules");
                    None
                }
            };
            self.status.update(&recipe, |r| {
                record_attempt(r, outcome);
                r.mark_error();
                if still_missing.is_some() {
                    r.modules = still_missing;
                }
            })?;
            execution.failed.push(recipe);
        }
        Ok(execution)
    }

    fn build(&self, recipe: &Path, mode: BuildMode) -> BuildOutcome {
        match self.toolchain.build(recipe, mode) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "toolchain did not run");
                BuildOutcome {
                    returncode: -1,
                    elapsed: std::time::Duration::ZERO,
                }
            }
        }
    }

    fn install_os_packages(&self, entries: &[Vec<String>], installed: &mut HashSet<String>) {
        if entries.is_empty() {
            return;
        }
        match &self.os_packages {
            Some(os) => osdeps::install_os_packages(os.installer, os.family, entries, installed),
            None => tracing::warn!(packages = ?entries, "unknown OS family, not installing"),
        }
    }

    /// Copy the toolchain's last log to `<eb_root>/tmp/<recipe>-<log name>`.
    fn keep_failed_log(&self, recipe: &str) {
        let Some(log) = self.toolchain.last_log() else {
            tracing::warn!("no build log to keep");
            return;
        };
        let tmp = self.eb_root.join("tmp");
        let target = tmp.join(format!("{recipe}-{}", file_name(&log)));
        let copied = fs::create_dir_all(&tmp).and_then(|()| fs::copy(&log, &target));
        match copied {
            Ok(_) => tracing::info!(log = %target.display(), "kept build log"),
            Err(e) => tracing::warn!(log = %log.display(), error = %e, "could not keep build log"),
        }
    }
}

fn record_attempt(record: &mut BuildStatusRecord, outcome: BuildOutcome) {
    record.returncode = outcome.returncode;
    record.buildtime = outcome.elapsed.as_secs();
    record.trydate = BuildStatusRecord::now_trydate();
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default()
}
