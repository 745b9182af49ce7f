//! Per-recipe build decisions.
//!
//! A recipe is ignored, skipped with a reason, found already satisfied, or
//! handed to the executor with the ordered list of modules still missing.

use std::path::Path;

use crate::catalog::{CatalogError, RecipeCatalog};
use crate::model::{BuildStatus, MissingModules, PackageSpec, StatusDocument};
use crate::policy::{Eligibility, ToolchainPolicy};
use crate::toolchain::{Toolchain, ToolchainError};

/// What to do with one recipe this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Already has history; leave it untouched.
    Ignore,
    /// Record as skipped with this reason.
    Skip(String),
    /// Nothing missing; record as success without building.
    Satisfied,
    /// Build `missing` in order, the recipe itself last.
    Proceed {
        spec: PackageSpec,
        missing: MissingModules,
    },
}

/// A recipe that could not be planned this pass.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Describe(#[from] CatalogError),

    #[error(transparent)]
    MissingQuery(#[from] ToolchainError),
}

/// Module-class include/exclude lists. An include list, when given,
/// takes precedence and the exclude list is not consulted.
#[derive(Debug, Clone, Default)]
pub struct ModuleFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ModuleFilter {
    /// Build from comma-separated lists as given on the command line.
    pub fn from_lists(include: Option<&str>, exclude: Option<&str>) -> Self {
        let split = |s: Option<&str>| -> Vec<String> {
            s.map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
        };
        Self {
            include: split(include),
            exclude: split(exclude),
        }
    }

    pub fn check(&self, module_class: &str) -> Eligibility {
        if !self.include.is_empty() {
            if !self.include.iter().any(|c| c == module_class) {
                return Eligibility::Skip("module class not included via --include option".into());
            }
        } else if self.exclude.iter().any(|c| c == module_class) {
            return Eligibility::Skip("module class excluded via --exclude option".into());
        }
        Eligibility::Ok
    }
}

/// Decides, per recipe, whether and what to build.
pub struct BuildPlanner<'a> {
    pub policy: &'a ToolchainPolicy,
    pub filter: &'a ModuleFilter,
    pub catalog: &'a RecipeCatalog<'a>,
    pub toolchain: &'a dyn Toolchain,

    /// Retry recipes previously recorded as skipped.
    pub recheck_skipped: bool,
}

impl BuildPlanner<'_> {
    /// Decide for the recipe at `path`, given the current status document.
    pub fn plan(&self, path: &Path, doc: &StatusDocument) -> Result<Plan, PlanError> {
        let recipe = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(record) = doc.get(&recipe)
            && (record.status != BuildStatus::Skipped || !self.recheck_skipped)
        {
            return Ok(Plan::Ignore);
        }

        let spec = self.catalog.describe(path)?;

        if let Eligibility::Skip(reason) = self.policy.check_spec(&spec) {
            return Ok(Plan::Skip(reason));
        }
        for dep in &spec.dependencies {
            let toolchain = spec.dependency_toolchain(dep);
            if let Eligibility::Skip(reason) = self.policy.check_toolchain(toolchain) {
                return Ok(Plan::Skip(reason));
            }
        }
        if let Eligibility::Skip(reason) = self.filter.check(&spec.module_class) {
            return Ok(Plan::Skip(reason));
        }

        let missing = self.toolchain.missing_modules(path)?;
        if missing.is_empty() {
            return Ok(Plan::Satisfied);
        }

        let failed: Vec<&str> = missing
            .iter()
            .filter(|m| {
                doc.get(&m.recipe)
                    .is_some_and(|r| r.status == BuildStatus::Error)
            })
            .map(|m| m.recipe.as_str())
            .collect();
        if !failed.is_empty() {
            tracing::info!(failed = %failed.join(", "), "missing dependencies have errors");
            return Ok(Plan::Skip("dependencies have errors".into()));
        }

        if let Some(old) = missing
            .iter()
            .find(|m| self.policy.dependency_too_old(&m.module))
        {
            tracing::info!(module = %old.module, "requires a toolchain below minimum");
            return Ok(Plan::Skip("dependency requires too old toolchain".into()));
        }

        Ok(Plan::Proceed { spec, missing })
    }
}
