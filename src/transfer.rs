//! Bulk transfers between the EasyBuild root and the bucket.
//!
//! `rclone` does the copying. Uploads and downloads are throttled by a
//! cooldown so a long run does not re-list the bucket after every package.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::context::Context;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

pub type Result<T> = core::result::Result<T, TransferError>;

/// Totals reported by the transfer tool for one copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferStats {
    pub total_transfers: u64,
    pub total_bytes: u64,
    pub errors: u64,
    pub last_error: String,
}

/// Copies a directory tree between local disk and the bucket.
pub trait TransferTool {
    /// Copy `source` to `dest`. A local source that does not exist is a
    /// no-op with empty stats.
    fn copy(&self, source: &str, dest: &str, args: &[String]) -> Result<TransferStats>;
}

/// `rclone copy` with JSON logging.
pub struct Rclone {
    program: PathBuf,
    ctx: Context,
    parallel: usize,
}

impl Rclone {
    pub fn new(program: impl Into<PathBuf>, ctx: Context, vcpus: usize) -> Self {
        Self {
            program: program.into(),
            ctx,
            parallel: (vcpus * 2).max(1),
        }
    }
}

/// One line of rclone's JSON log. Only the stats lines matter.
#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    source: String,
    stats: Option<TransferStats>,
}

/// The last `accounting/stats` entry of an rclone JSON log.
pub fn parse_stats(log: &str) -> Option<TransferStats> {
    log.lines()
        .filter_map(|line| serde_json::from_str::<LogLine>(line).ok())
        .filter(|l| l.source.starts_with("accounting/stats"))
        .filter_map(|l| l.stats)
        .last()
}

impl TransferTool for Rclone {
    fn copy(&self, source: &str, dest: &str, args: &[String]) -> Result<TransferStats> {
        if source.starts_with('/') && !Path::new(source).exists() {
            tracing::info!(source, "source does not exist, skipping");
            return Ok(TransferStats::default());
        }

        let parallel = self.parallel.to_string();
        let output = self
            .ctx
            .command(&self.program)
            .arg("copy")
            .args(args)
            .args(["--verbose", "--use-json-log"])
            .args(["--transfers", &parallel, "--checkers", &parallel])
            .arg(source)
            .arg(dest)
            .output()
            .map_err(|source| TransferError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        let log = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            tracing::warn!(
                code = output.status.code().unwrap_or(-1),
                source,
                dest,
                "rclone exited with an error"
            );
        }
        let mut stats = parse_stats(&log).unwrap_or_default();
        if !output.status.success() && stats.errors == 0 {
            stats.errors = 1;
            stats.last_error = log.lines().last().unwrap_or_default().to_string();
        }
        Ok(stats)
    }
}

// ── Cooldown ──

/// Enforces a minimum gap between two uploads or two downloads.
#[derive(Debug, Clone)]
pub struct SyncSchedule {
    delay: Duration,
    last_upload: Option<Instant>,
    last_download: Option<Instant>,
}

impl SyncSchedule {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_upload: None,
            last_download: None,
        }
    }

    fn due(&self, last: Option<Instant>, now: Instant) -> bool {
        last.is_none_or(|t| now.duration_since(t) > self.delay)
    }

    pub fn upload_due(&self, now: Instant) -> bool {
        self.due(self.last_upload, now)
    }

    pub fn download_due(&self, now: Instant) -> bool {
        self.due(self.last_download, now)
    }

    pub fn mark_upload(&mut self, now: Instant) {
        self.last_upload = Some(now);
    }

    pub fn mark_download(&mut self, now: Instant) {
        self.last_download = Some(now);
    }
}

// ── Passes ──

/// How the transfer tool decides a file is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Checksum,
    SizeOnly,
}

impl Compare {
    fn flag(self) -> &'static str {
        match self {
            Self::Checksum => "--checksum",
            Self::SizeOnly => "--size-only",
        }
    }
}

/// One copy within an upload or download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pass {
    pub label: &'static str,
    pub source: String,
    pub dest: String,
    pub args: Vec<String>,
}

/// Aggregate of several passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub transfers: u64,
    pub bytes: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

impl TransferSummary {
    fn add(&mut self, stats: &TransferStats) {
        self.transfers += stats.total_transfers;
        self.bytes += stats.total_bytes;
        self.errors += stats.errors;
        if !stats.last_error.is_empty() {
            self.last_error = Some(stats.last_error.clone());
        }
    }
}

/// Moves build artifacts for one platform prefix.
pub struct Syncer<'a> {
    tool: &'a dyn TransferTool,
    eb_root: PathBuf,
    home: PathBuf,
    /// `:s3:<bucket>/<archive_root>`
    remote: String,
    prefix: String,
    upload_compare: Compare,
    download_compare: Compare,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl<'a> Syncer<'a> {
    pub fn new(
        tool: &'a dyn TransferTool,
        eb_root: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        archive_path: &str,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            tool,
            eb_root: eb_root.into(),
            home: home.into(),
            remote: format!(":s3:{archive_path}"),
            prefix: prefix.into(),
            upload_compare: Compare::Checksum,
            download_compare: Compare::Checksum,
        }
    }

    /// Start every comparison from sizes only.
    pub fn size_only(mut self) -> Self {
        self.upload_compare = Compare::SizeOnly;
        self.download_compare = Compare::SizeOnly;
        self
    }

    fn local(&self, sub: &str) -> String {
        self.eb_root.join(sub).to_string_lossy().into_owned()
    }

    /// Copies making up the next upload. Logs and sources only go up while
    /// comparing by checksum.
    pub fn upload_passes(&self) -> Vec<Pass> {
        let compare = self.upload_compare.flag();
        let home = self.home.to_string_lossy().into_owned();
        let (remote, prefix) = (&self.remote, &self.prefix);
        let mut passes = Vec::new();

        if self.upload_compare == Compare::Checksum {
            passes.push(Pass {
                label: "bootstrap output",
                source: home.clone(),
                dest: format!("{remote}/{prefix}/logs/"),
                args: args(&["--include", "out.bootstrap.*"]),
            });
            passes.push(Pass {
                label: "sources",
                source: self.local("sources"),
                dest: format!("{remote}/sources/"),
                args: args(&["--links", "--fast-list", "--s3-no-head", compare]),
            });
        }
        passes.push(Pass {
            label: "modules",
            source: self.local("modules"),
            dest: format!("{remote}/{prefix}/modules/"),
            args: args(&["--links", "--fast-list", "--s3-no-head", compare]),
        });
        passes.push(Pass {
            label: "software",
            source: self.local("software"),
            dest: format!("{remote}/{prefix}/software/"),
            args: args(&[
                "--links",
                "--fast-list",
                "--s3-no-head",
                compare,
                "--include",
                "*.eb.tar.gz",
            ]),
        });
        passes.push(Pass {
            label: "build output",
            source: home,
            dest: format!("{remote}/{prefix}/logs/"),
            args: args(&["--fast-list", "--s3-no-head", compare, "--include", "out.easybuild.*"]),
        });
        passes.push(Pass {
            label: "failed logs",
            source: self.local("tmp"),
            dest: format!("{remote}/{prefix}/logs/failed/"),
            args: args(&["--fast-list", "--s3-no-head", compare]),
        });
        passes
    }

    fn run(&self, passes: &[Pass]) -> TransferSummary {
        let mut summary = TransferSummary::default();
        for pass in passes {
            tracing::info!(pass = pass.label, dest = %pass.dest, "copying");
            match self.tool.copy(&pass.source, &pass.dest, &pass.args) {
                Ok(stats) => {
                    if stats.errors > 0 {
                        tracing::warn!(pass = pass.label, last_error = %stats.last_error, "copy had errors");
                    }
                    summary.add(&stats);
                }
                Err(e) => {
                    tracing::warn!(pass = pass.label, error = %e, "copy failed");
                    summary.errors += 1;
                    summary.last_error = Some(e.to_string());
                }
            }
        }
        summary
    }

    /// Upload everything. Later uploads compare by size only.
    pub fn upload(&mut self) -> TransferSummary {
        let summary = self.run(&self.upload_passes());
        self.upload_compare = Compare::SizeOnly;
        summary
    }

    /// Upload everything, verified by checksum.
    pub fn final_upload(&mut self) -> TransferSummary {
        self.upload_compare = Compare::Checksum;
        self.upload()
    }

    /// Fetch module files. Software arrives separately as archives.
    pub fn download_modules(&mut self) -> TransferSummary {
        let pass = Pass {
            label: "modules",
            source: format!("{}/{}/modules/", self.remote, self.prefix),
            dest: self.local("modules"),
            args: args(&["--fast-list", "--links", self.download_compare.flag()]),
        };
        let summary = self.run(&[pass]);
        self.download_compare = Compare::SizeOnly;
        summary
    }

    pub fn eb_root(&self) -> &Path {
        &self.eb_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::FakeTransfer;

    const LOG: &str = r#"{"level":"info","msg":"Copied (new)","object":"a.lua","source":"operations/copy.go:1","time":"t"}
{"level":"info","msg":"\nTransferred: 1 / 2","source":"accounting/stats.go:508","stats":{"bytes":10,"errors":0,"totalTransfers":1,"totalBytes":10,"transfers":1},"time":"t"}
not json at all
{"level":"info","msg":"\nTransferred: 2 / 2","source":"accounting/stats.go:508","stats":{"bytes":30,"errors":1,"lastError":"AccessDenied","totalTransfers":2,"totalBytes":30,"transfers":2},"time":"t"}
"#;

    #[test]
    fn takes_last_stats_entry() {
        let stats = parse_stats(LOG).unwrap();
        assert_eq!(stats.total_transfers, 2);
        assert_eq!(stats.total_bytes, 30);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.last_error, "AccessDenied");
    }

    #[test]
    fn log_without_stats_has_none() {
        assert!(parse_stats("{\"level\":\"info\",\"msg\":\"x\"}\n").is_none());
    }

    #[test]
    fn cooldown_blocks_second_transfer() {
        let mut schedule = SyncSchedule::new(Duration::from_secs(3600));
        let t0 = Instant::now();
        assert!(schedule.download_due(t0));
        schedule.mark_download(t0);
        assert!(!schedule.download_due(t0 + Duration::from_secs(60)));
        assert!(schedule.download_due(t0 + Duration::from_secs(3601)));
        assert!(schedule.upload_due(t0));
    }

    #[test]
    fn first_upload_uses_checksums_then_size_only() {
        let tool = FakeTransfer::default();
        let mut syncer = Syncer::new(&tool, "/opt/eb", "/home/ec2-user", "cache/aws", "amzn-2023_graviton-3");

        let first = syncer.upload_passes();
        assert_eq!(first.len(), 6);
        assert_eq!(first[0].label, "bootstrap output");
        assert_eq!(first[1].dest, ":s3:cache/aws/sources/");
        assert!(first[2].args.contains(&"--checksum".to_string()));

        syncer.upload();
        let later = syncer.upload_passes();
        let labels: Vec<&str> = later.iter().map(|p| p.label).collect();
        assert_eq!(labels, ["modules", "software", "build output", "failed logs"]);
        assert!(later.iter().all(|p| p.args.contains(&"--size-only".to_string())));
        assert_eq!(
            later[1].dest,
            ":s3:cache/aws/amzn-2023_graviton-3/software/"
        );
        assert_eq!(tool.calls().len(), 6);
    }

    #[test]
    fn final_upload_returns_to_checksums() {
        let tool = FakeTransfer::default();
        let mut syncer = Syncer::new(&tool, "/opt/eb", "/home/u", "b/aws", "p");
        syncer.upload();
        syncer.final_upload();
        let calls = tool.calls();
        assert_eq!(calls.len(), 12);
        // The bootstrap output pass copies by pattern only.
        assert_eq!(calls[6].2, ["--include", "out.bootstrap.*"]);
        assert!(
            calls[7..]
                .iter()
                .all(|(_, _, args)| args.contains(&"--checksum".to_string()))
        );
    }

    #[test]
    fn upload_summary_adds_up_passes() {
        let tool = FakeTransfer::with_stats(TransferStats {
            total_transfers: 2,
            total_bytes: 100,
            errors: 1,
            last_error: "boom".into(),
        });
        let mut syncer = Syncer::new(&tool, "/opt/eb", "/home/u", "b/aws", "p").size_only();
        let summary = syncer.upload();
        assert_eq!(summary.transfers, 8);
        assert_eq!(summary.errors, 4);
        assert_eq!(summary.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn download_pulls_modules_for_prefix() {
        let tool = FakeTransfer::default();
        let mut syncer = Syncer::new(&tool, "/opt/eb", "/home/u", "b/aws", "p");
        syncer.download_modules();
        let calls = tool.calls();
        assert_eq!(calls[0].0, ":s3:b/aws/p/modules/");
        assert_eq!(calls[0].1, "/opt/eb/modules");
    }
}
