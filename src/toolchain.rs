//! The external build toolchain.
//!
//! [`EasyBuild`] drives `eb`. Build output streams straight to the
//! terminal; only exit codes, the missing-module report, and the last log
//! path are read back.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::context::Context;
use crate::model::{MissingModule, MissingModules};

/// `* <module> (<recipe>.eb)` lines of `eb --missing-modules`.
static MISSING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\* (\S+) \((\S+\.eb)\)").expect("missing module regex is valid"));

#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("missing-module query for {recipe} failed: {message}")]
    Query { recipe: String, message: String },
}

pub type Result<T> = core::result::Result<T, ToolchainError>;

/// How strictly a recipe is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// A single dependency, no dependency resolution.
    Permissive,
    /// The target recipe, re-resolving anything the dependency chain missed.
    Strict,
}

/// Result of one toolchain invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Process exit code; `-1` when killed by a signal.
    pub returncode: i32,
    pub elapsed: Duration,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Builds recipes and reports what is missing.
pub trait Toolchain {
    /// Build one recipe. A non-zero exit is an outcome, not an error.
    fn build(&self, recipe: &Path, mode: BuildMode) -> Result<BuildOutcome>;

    /// Modules not yet installed for a recipe, in build order, target last.
    fn missing_modules(&self, recipe: &Path) -> Result<MissingModules>;

    /// Path of the most recent build log, if any.
    fn last_log(&self) -> Option<PathBuf>;
}

/// Whether a recipe's test failures are tolerated: GPU packages cannot run
/// their tests on CPU-only builders.
pub fn tolerates_test_failures(recipe: &Path) -> bool {
    recipe
        .file_name()
        .is_some_and(|f| f.to_string_lossy().contains("CUDA"))
}

/// Arguments for `eb` after the program name.
pub fn build_args(recipe: &Path, mode: BuildMode) -> Vec<String> {
    let mut args = Vec::new();
    if mode == BuildMode::Strict {
        args.push("--robot".to_string());
    }
    args.push("--umask=002".to_string());
    if tolerates_test_failures(recipe) {
        args.push("--ignore-test-failure".to_string());
    }
    args.push(recipe.to_string_lossy().into_owned());
    args
}

/// Parse `eb --missing-modules` output, keeping its order.
pub fn parse_missing_modules(output: &str) -> MissingModules {
    output
        .lines()
        .filter_map(|line| MISSING_LINE.captures(line))
        .map(|caps| MissingModule {
            module: caps[1].to_string(),
            recipe: caps[2].to_string(),
        })
        .collect()
}

// ── EasyBuild ──

/// `eb` with its prefix pinned to the configured EasyBuild root.
pub struct EasyBuild {
    ctx: Context,
    program: PathBuf,
}

impl EasyBuild {
    pub fn new(ctx: &Context, eb_root: &Path) -> Self {
        let mut ctx = ctx.clone();
        ctx.set("EASYBUILD_PREFIX", &eb_root.to_string_lossy());
        Self {
            ctx,
            program: PathBuf::from("eb"),
        }
    }

    fn spawn_error(&self, source: std::io::Error) -> ToolchainError {
        ToolchainError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        }
    }
}

impl Toolchain for EasyBuild {
    fn build(&self, recipe: &Path, mode: BuildMode) -> Result<BuildOutcome> {
        let args = build_args(recipe, mode);
        tracing::info!(command = %format!("eb {}", args.join(" ")), "running toolchain");

        let started = Instant::now();
        let status = self
            .ctx
            .command(&self.program)
            .args(&args)
            .status()
            .map_err(|e| self.spawn_error(e))?;

        let outcome = BuildOutcome {
            returncode: status.code().unwrap_or(-1),
            elapsed: started.elapsed(),
        };
        tracing::info!(returncode = outcome.returncode, "toolchain finished");
        Ok(outcome)
    }

    fn missing_modules(&self, recipe: &Path) -> Result<MissingModules> {
        let output = self
            .ctx
            .command(&self.program)
            .arg("--missing-modules")
            .arg(recipe)
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(ToolchainError::Query {
                recipe: recipe.to_string_lossy().into_owned(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::debug!(output = %stdout, "eb --missing-modules");
        Ok(parse_missing_modules(&stdout))
    }

    fn last_log(&self) -> Option<PathBuf> {
        let output = self
            .ctx
            .command(&self.program)
            .arg("--last-log")
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }
}
