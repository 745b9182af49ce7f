//! Package specs: what a recipe says it builds.

use serde::{Deserialize, Serialize};

/// A named, versioned compiler/library stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainRef {
    pub name: String,
    pub version: String,
}

impl ToolchainRef {
    /// The `system` toolchain builds with whatever the OS provides.
    pub fn is_system(&self) -> bool {
        self.name == "system"
    }
}

/// A declared dependency of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,

    /// Explicit toolchain; `None` means the parent's toolchain.
    pub toolchain: Option<ToolchainRef>,
}

/// Structured metadata for one recipe, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    pub version_suffix: String,
    pub toolchain: ToolchainRef,
    pub dependencies: Vec<Dependency>,

    /// OS packages to install first. Each entry lists alternative names
    /// for the same package across distributions.
    pub os_dependencies: Vec<Vec<String>>,

    pub module_class: String,
}

impl PackageSpec {
    /// Install directory relative to the software root:
    /// `name/version[suffix][-toolchain-version]`.
    pub fn install_dir(&self) -> String {
        let toolchain = if self.toolchain.is_system() {
            String::new()
        } else {
            format!("-{}-{}", self.toolchain.name, self.toolchain.version)
        };
        format!(
            "{}/{}{}{toolchain}",
            self.name, self.version, self.version_suffix
        )
    }

    /// The toolchain a dependency is built with.
    pub fn dependency_toolchain<'a>(&'a self, dep: &'a Dependency) -> &'a ToolchainRef {
        dep.toolchain.as_ref().unwrap_or(&self.toolchain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(toolchain: &str, suffix: &str) -> PackageSpec {
        PackageSpec {
            name: "Boost".into(),
            version: "1.82.0".into(),
            version_suffix: suffix.into(),
            toolchain: ToolchainRef {
                name: toolchain.into(),
                version: if toolchain == "system" {
                    "system".into()
                } else {
                    "12.3.0".into()
                },
            },
            dependencies: vec![],
            os_dependencies: vec![],
            module_class: "devel".into(),
        }
    }

    #[test]
    fn install_dir_includes_toolchain() {
        assert_eq!(spec("GCC", "").install_dir(), "Boost/1.82.0-GCC-12.3.0");
    }

    #[test]
    fn install_dir_includes_suffix() {
        assert_eq!(
            spec("GCC", "-MPI").install_dir(),
            "Boost/1.82.0-MPI-GCC-12.3.0"
        );
    }

    #[test]
    fn install_dir_omits_system_toolchain() {
        assert_eq!(spec("system", "").install_dir(), "Boost/1.82.0");
    }

    #[test]
    fn dependency_inherits_parent_toolchain() {
        let parent = spec("GCC", "");
        let dep = Dependency {
            name: "zlib".into(),
            version: "1.2.13".into(),
            toolchain: None,
        };
        assert_eq!(parent.dependency_toolchain(&dep).name, "GCC");
    }
}
