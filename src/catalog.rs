//! The recipe tree: walking it, picking the newest recipe per software
//! directory, and turning a recipe into a [`PackageSpec`].
//!
//! Recipe metadata comes from EasyBuild's own parser, run in a `python3`
//! subprocess that prints the fields we need as JSON.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use ignore::WalkBuilder;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::model::{Dependency, PackageSpec, ToolchainRef};
use crate::version::Version;

/// Directory names never descended into.
const SKIP_DIRS: &[&str] = &[".snapshot", "__archive__"];

/// `<name>-<version>[-<toolchain>[-<toolchain version>]].eb`
static RECIPE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-(\d+(?:\.\d+)*)(?:-(\w+(?:-\d+(?:\.\d+)*(?:[ab]\d+)?)?))?\.")
        .expect("recipe version regex is valid")
});

/// Errors from reading or describing recipes.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("recipe not found in tree: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, CatalogError>;

// ── Parser ──

/// Raw fields of a recipe as the recipe parser reports them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecipe {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub versionsuffix: Option<String>,
    #[serde(default)]
    pub toolchain: Option<RawToolchain>,

    /// `[name, version, suffix?, toolchain?]` tuples.
    #[serde(default)]
    pub dependencies: Vec<Value>,

    /// Strings or lists of alternative names.
    #[serde(default)]
    pub osdependencies: Vec<Value>,

    #[serde(default)]
    pub moduleclass: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawToolchain {
    pub name: String,
    pub version: String,
}

impl RawRecipe {
    /// Normalize into a [`PackageSpec`]. Fails when the recipe has no name
    /// or no toolchain.
    pub fn into_spec(self, path: &Path) -> Result<PackageSpec> {
        let parse_error = |message: &str| CatalogError::Parse {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        if self.name.is_empty() {
            return Err(parse_error("recipe has no name"));
        }
        let toolchain = self.toolchain.ok_or_else(|| parse_error("recipe has no toolchain"))?;

        let dependencies = self.dependencies.iter().filter_map(dependency).collect();
        let os_dependencies = self
            .osdependencies
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(vec![s.clone()]),
                Value::Array(alts) => {
                    let names: Vec<String> = alts
                        .iter()
                        .filter_map(|a| a.as_str().map(str::to_string))
                        .collect();
                    (!names.is_empty()).then_some(names)
                }
                _ => None,
            })
            .collect();

        Ok(PackageSpec {
            name: self.name,
            version: self.version,
            version_suffix: self.versionsuffix.unwrap_or_default(),
            toolchain: ToolchainRef {
                name: toolchain.name,
                version: toolchain.version,
            },
            dependencies,
            os_dependencies,
            module_class: self.moduleclass.unwrap_or_default(),
        })
    }
}

/// One dependency tuple. A toolchain of `true` means the system toolchain.
fn dependency(value: &Value) -> Option<Dependency> {
    let items = value.as_array()?;
    let name = items.first()?.as_str()?.to_string();
    let version = match items.get(1)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let toolchain = match items.get(3) {
        Some(Value::Object(tc)) => Some(ToolchainRef {
            name: tc.get("name")?.as_str()?.to_string(),
            version: tc.get("version")?.as_str()?.to_string(),
        }),
        Some(Value::Bool(true)) => Some(ToolchainRef {
            name: "system".into(),
            version: "system".into(),
        }),
        _ => None,
    };
    Some(Dependency {
        name,
        version,
        toolchain,
    })
}

/// Extracts structured fields from a recipe file.
pub trait RecipeParser {
    fn parse(&self, path: &Path) -> Result<RawRecipe>;
}

/// Runs EasyBuild's `EasyConfigParser` under `python3`.
pub struct EasyconfigParser {
    python: PathBuf,
}

const DUMP_SCRIPT: &str = r#"
import json, sys
from easybuild.framework.easyconfig.parser import EasyConfigParser
d = EasyConfigParser(sys.argv[1]).get_config_dict()
keys = ("name", "version", "versionsuffix", "toolchain", "dependencies", "osdependencies", "moduleclass")
print(json.dumps({k: d.get(k) for k in keys}, default=str))
"#;

impl EasyconfigParser {
    pub fn new() -> Self {
        Self {
            python: PathBuf::from("python3"),
        }
    }
}

impl Default for EasyconfigParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipeParser for EasyconfigParser {
    fn parse(&self, path: &Path) -> Result<RawRecipe> {
        let output = Command::new(&self.python)
            .arg("-c")
            .arg(DUMP_SCRIPT)
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CatalogError::Parse {
                path: path.to_path_buf(),
                message: stderr.lines().last().unwrap_or("parser failed").to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| CatalogError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

// ── Catalog ──

/// A recipe tree rooted at one directory.
pub struct RecipeCatalog<'a> {
    root: PathBuf,
    parser: &'a dyn RecipeParser,
}

impl<'a> RecipeCatalog<'a> {
    pub fn new(root: impl Into<PathBuf>, parser: &'a dyn RecipeParser) -> Self {
        Self {
            root: root.into(),
            parser,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every directory under the root, root included, in sorted order.
    pub fn walk(&self) -> Vec<PathBuf> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !SKIP_DIRS.contains(&name.as_ref())
            })
            .sort_by_file_name(Ord::cmp);

        builder
            .build()
            .filter_map(|entry| match entry {
                Ok(e) if e.file_type().is_some_and(|ft| ft.is_dir()) => Some(e.into_path()),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable path");
                    None
                }
            })
            .collect()
    }

    /// Parse a recipe into its package spec.
    pub fn describe(&self, path: &Path) -> Result<PackageSpec> {
        self.parser.parse(path)?.into_spec(path)
    }

    /// Find a recipe by filename. Checks the conventional
    /// `<letter>/<name>/<file>` location first, then searches the tree.
    pub fn locate(&self, filename: &str) -> Result<PathBuf> {
        if let Some(name) = recipe_name(filename)
            && let Some(first) = name.chars().next()
        {
            let path = self
                .root
                .join(first.to_lowercase().to_string())
                .join(name)
                .join(filename);
            if path.is_file() {
                return Ok(path);
            }
        }
        self.walk()
            .into_iter()
            .map(|dir| dir.join(filename))
            .find(|p| p.is_file())
            .ok_or_else(|| CatalogError::NotFound(filename.to_string()))
    }
}

/// The software name part of a recipe filename.
pub fn recipe_name(filename: &str) -> Option<&str> {
    RECIPE_VERSION
        .find(filename)
        .map(|m| &filename[..m.start()])
        .filter(|n| !n.is_empty())
}

/// Ordering key of a recipe filename: software version, then toolchain.
#[derive(Debug, PartialEq, Eq)]
struct RecipeKey {
    software: Version,
    /// `None` when the toolchain token is not a plain version.
    toolchain: Option<Version>,
}

impl Ord for RecipeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.software
            .cmp(&other.software)
            .then_with(|| self.toolchain.cmp(&other.toolchain))
    }
}

impl PartialOrd for RecipeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn recipe_key(filename: &str) -> Option<RecipeKey> {
    let caps = RECIPE_VERSION.captures(filename)?;
    let software = Version::parse(caps.get(1)?.as_str());
    let toolchain = match caps.get(2) {
        Some(tc) => Version::strict(tc.as_str()),
        None => Some(Version::parse("0")),
    };
    Some(RecipeKey {
        software,
        toolchain,
    })
}

/// The newest `*.eb` file in a directory, or `None` if none match the
/// filename pattern. Ties go to the lexically greatest filename.
pub fn latest_recipe(directory: &Path) -> Result<Option<String>> {
    let mut best: Option<(RecipeKey, String)> = None;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        if !filename.ends_with(".eb") {
            continue;
        }
        let Some(key) = recipe_key(&filename) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((k, f)) => (&key, &filename) > (k, f),
        };
        if better {
            best = Some((key, filename));
        }
    }
    Ok(best.map(|(_, f)| f))
}
