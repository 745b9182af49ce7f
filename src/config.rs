//! ebfleet configuration.
//!
//! Loaded from `~/.ebfleet/config.toml`, or the file named by `EBFLEET_CONFIG`.
//! Every key has a default, so a missing file is a valid configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::{env, fs, io};

use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHome,

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// ebfleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Bucket holding status files, modules, sources and archives.
    pub bucket: String,

    /// Top-level key prefix inside the bucket.
    pub archive_root: String,

    /// AWS profile passed to every `aws` and `rclone` call.
    pub aws_profile: Option<String>,

    pub aws_region: String,

    /// Sender and recipient of notifications. Notifications are off when unset.
    pub email: Option<String>,

    /// EasyBuild prefix: `software/`, `modules/`, `sources/`, `tmp/` live here.
    pub eb_root: PathBuf,

    /// Root of the recipe tree. Defaults to `~/easybuild-easyconfigs/easybuild/easyconfigs`.
    pub recipe_root: Option<PathBuf>,

    /// Minimum seconds between two bulk downloads or two bulk uploads.
    pub copy_delay_secs: u64,

    /// Parallelism hint for the toolchain, transfers, and extraction.
    pub vcpus: usize,

    /// Path or name of the rclone binary.
    pub rclone: PathBuf,

    /// Minimum version per toolchain name. Toolchains not listed are unsupported.
    pub min_toolchains: BTreeMap<String, String>,

    pub monitor: MonitorConfig,

    pub log_format: LogFormat,
}

/// Idle monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitorConfig {
    /// Length of one sampling window.
    pub interval_secs: u64,

    /// Consecutive idle samples before the worker terminates itself.
    pub min_idle_count: usize,

    /// Idle sample log. Defaults to `$TMPDIR/ebfleet-idle-state.txt`.
    pub state_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            min_idle_count: 72,
            state_file: None,
        }
    }
}

impl MonitorConfig {
    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("ebfleet-idle-state.txt"))
    }
}

/// The stock minimum-toolchain table.
pub fn default_min_toolchains() -> BTreeMap<String, String> {
    [
        ("system", "system"),
        ("GCC", "11.0"),
        ("GCCcore", "11.0"),
        ("LLVM", "12.0"),
        ("foss", "2022a"),
        ("gfbf", "2022a"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: "easybuild-cache".to_string(),
            archive_root: "aws".to_string(),
            aws_profile: None,
            aws_region: "us-west-2".to_string(),
            email: None,
            eb_root: PathBuf::from("/opt/eb"),
            recipe_root: None,
            copy_delay_secs: 3600,
            vcpus: 4,
            rclone: PathBuf::from("rclone"),
            min_toolchains: default_min_toolchains(),
            monitor: MonitorConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load config from the config path, falling back to defaults when
    /// the file does not exist. `AWS_PROFILE` overrides the profile key.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path().ok_or(ConfigError::NoHome)?;
        let mut config = Self::load_from(&path)?;
        if let Ok(profile) = env::var("AWS_PROFILE")
            && !profile.is_empty()
        {
            config.aws_profile = Some(profile);
        }
        Ok(config)
    }

    /// Load config from a specific file. A missing file yields defaults.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The config file path: `$EBFLEET_CONFIG` or `~/.ebfleet/config.toml`.
    pub fn path() -> Option<PathBuf> {
        if let Some(path) = env::var_os("EBFLEET_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|h| h.join(".ebfleet").join("config.toml"))
    }

    /// Bucket key of the status document for a platform prefix.
    pub fn status_key(&self, prefix: &str) -> String {
        format!("{}/{prefix}/eb-build-status.json", self.archive_root)
    }

    /// `bucket/archive_root`, the transfer tool's view of the archive.
    pub fn archive_path(&self) -> String {
        format!("{}/{}", self.bucket, self.archive_root)
    }

    pub fn recipe_root(&self) -> Option<PathBuf> {
        self.recipe_root.clone().or_else(|| {
            dirs::home_dir().map(|h| {
                h.join("easybuild-easyconfigs")
                    .join("easybuild")
                    .join("easyconfigs")
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.bucket, "easybuild-cache");
        assert_eq!(config.copy_delay_secs, 3600);
        assert_eq!(config.monitor.min_idle_count, 72);
        assert_eq!(config.min_toolchains["GCC"], "11.0");
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
bucket = "my-cache"
copy-delay-secs = 60

[min-toolchains]
GCC = "12.0"

[monitor]
min-idle-count = 3
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bucket, "my-cache");
        assert_eq!(config.archive_root, "aws");
        assert_eq!(config.copy_delay_secs, 60);
        assert_eq!(config.min_toolchains.len(), 1);
        assert_eq!(config.monitor.min_idle_count, 3);
        assert_eq!(config.monitor.interval_secs, 60);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "bucket = [").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn status_key_is_scoped_by_prefix() {
        let config = Config::default();
        assert_eq!(
            config.status_key("amzn-2023_graviton-3"),
            "aws/amzn-2023_graviton-3/eb-build-status.json"
        );
    }
}
