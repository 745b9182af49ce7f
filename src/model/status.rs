//! Build status records: one per recipe filename.
//!
//! The JSON shape is shared with other tooling reading the same bucket,
//! so field names stay lowercase and unseparated (`returncode`, `trydate`).

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The whole status document: recipe filename to record.
pub type StatusDocument = BTreeMap<String, BuildStatusRecord>;

/// Outcome of the last attempt at a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Planned but no outcome recorded yet.
    #[default]
    Unknown,

    /// Deliberately not built; `reason` says why.
    Skipped,

    /// Built (or found already installed).
    Success,

    /// The toolchain exited non-zero.
    Error,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Unknown => "unknown",
            Self::Skipped => "skipped",
            Self::Success => "success",
            Self::Error => "error",
        })
    }
}

/// A dependency the toolchain reports as not yet installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingModule {
    /// Module name, usually `name/version-toolchain`.
    pub module: String,

    /// Recipe filename that provides it.
    pub recipe: String,
}

/// Missing modules in the order the toolchain would build them.
///
/// The target recipe itself is the last entry. Serialized as a JSON object
/// whose key order is the build order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingModules(pub Vec<MissingModule>);

impl MissingModules {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MissingModule> {
        self.0.iter()
    }

    /// Recipes of everything except the final entry (the target).
    pub fn dependencies(&self) -> &[MissingModule] {
        match self.0.split_last() {
            Some((_, deps)) => deps,
            None => &[],
        }
    }
}

impl FromIterator<MissingModule> for MissingModules {
    fn from_iter<I: IntoIterator<Item = MissingModule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for MissingModules {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for m in &self.0 {
            map.serialize_entry(&m.module, &m.recipe)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MissingModules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = MissingModules;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of module name to recipe filename")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut modules = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((module, recipe)) = access.next_entry::<String, String>()? {
                    modules.push(MissingModule { module, recipe });
                }
                Ok(MissingModules(modules))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Persisted outcome of the last attempt at one recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatusRecord {
    #[serde(default)]
    pub status: BuildStatus,

    #[serde(default = "not_applicable")]
    pub reason: String,

    /// Exit code of the last toolchain run, `-1` if never run.
    #[serde(default = "never_run")]
    pub returncode: i32,

    #[serde(default)]
    pub errorcount: u32,

    /// ISO-8601 with UTC offset, e.g. `2024-05-01T23:10:04-07:00`.
    #[serde(default)]
    pub trydate: String,

    /// Wall-clock seconds of the last attempt.
    #[serde(default)]
    pub buildtime: u64,

    /// Still-missing dependencies after a failed attempt, `null` when satisfied.
    #[serde(default)]
    pub modules: Option<MissingModules>,
}

fn not_applicable() -> String {
    "n/a".to_string()
}

fn never_run() -> i32 {
    -1
}

impl BuildStatusRecord {
    /// A record for a recipe that has not been attempted yet.
    pub fn new(trydate: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::Unknown,
            reason: not_applicable(),
            returncode: never_run(),
            errorcount: 0,
            trydate: trydate.into(),
            buildtime: 0,
            modules: None,
        }
    }

    /// The current local time in the `trydate` format.
    pub fn now_trydate() -> String {
        jiff::Zoned::now()
            .strftime("%Y-%m-%dT%H:%M:%S%:z")
            .to_string()
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = BuildStatus::Skipped;
        self.reason = reason.into();
    }

    pub fn mark_success(&mut self, reason: impl Into<String>) {
        self.status = BuildStatus::Success;
        self.reason = reason.into();
        self.modules = None;
    }

    pub fn mark_error(&mut self) {
        self.status = BuildStatus::Error;
        self.reason = not_applicable();
        self.errorcount += 1;
    }
}
