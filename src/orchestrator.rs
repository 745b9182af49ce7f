//! One pass over the recipe catalog: the newest recipe of every directory
//! is planned, and built when the plan says so.
//!
//! Progress lives in the shared status store, so a pass killed at any
//! point resumes from the last recorded outcome on the next run.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Instant;

use crate::archive;
use crate::catalog::{self, RecipeCatalog};
use crate::executor::{BUILT_REASON, BuildExecutor};
use crate::fleet::FleetController;
use crate::logging;
use crate::notify::Notifier;
use crate::planner::{BuildPlanner, Plan};
use crate::status::{self, ObjectStore, StatusStore};
use crate::transfer::{SyncSchedule, Syncer};

/// Reason recorded when every module a recipe needs is already present.
pub const SATISFIED_REASON: &str = "already installed";

/// Running counts for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    /// Directories with a recipe.
    pub tried: usize,
    /// Recipes not handed to the executor.
    pub skipped: usize,
    pub built: usize,
    pub failed: Vec<String>,
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} newest recipes ({} skipped), {} packages built, {} builds failed",
            self.tried,
            self.skipped,
            self.built,
            self.failed.len()
        )
    }
}

impl Tally {
    /// Closing summary, also the body of the completion notification.
    pub fn summary(&self) -> String {
        let mut text = format!("BUILD FINISHED. Tried {self}");
        if !self.failed.is_empty() {
            text.push_str("\nFailed recipes: ");
            text.push_str(&self.failed.join(", "));
        }
        text
    }
}

pub struct Orchestrator<'a> {
    pub catalog: &'a RecipeCatalog<'a>,
    pub planner: BuildPlanner<'a>,
    pub executor: BuildExecutor<'a>,
    pub status: &'a StatusStore<'a>,
    /// Bucket holding the software archives.
    pub store: &'a dyn ObjectStore,
    pub syncer: Syncer<'a>,
    pub schedule: SyncSchedule,
    /// Sweeps failed peers at the start of the pass and before each build
    /// when set.
    pub fleet: Option<FleetController<'a>>,
    pub own_instance: Option<String>,
    pub notifier: &'a dyn Notifier,
    /// Platform prefix, e.g. `amzn-2023_graviton-3`.
    pub prefix: String,
    /// Bucket key prefix of the archives, `<archive_root>/<prefix>/software`.
    pub software_key: String,
    pub untar_workers: usize,
}

impl Orchestrator<'_> {
    /// Walk the catalog once. Status store failures end the pass; anything
    /// else only abandons the recipe at hand.
    pub fn run(&mut self) -> status::Result<Tally> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let _pass = logging::pass_span(&self.prefix, &run_id).entered();
        tracing::info!(root = %self.catalog.root().display(), "starting pass");

        self.sweep_peers();

        let mut tally = Tally::default();
        let mut installed = HashSet::new();

        for dir in self.catalog.walk() {
            let recipe = match catalog::latest_recipe(&dir) {
                Ok(Some(recipe)) => recipe,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "could not list recipes");
                    continue;
                }
            };
            let path = dir.join(&recipe);
            tally.tried += 1;
            tally.skipped += 1;

            let _span = logging::recipe_span(&recipe).entered();
            self.step(&path, &recipe, &mut tally, &mut installed)?;
            tracing::info!(%tally, "progress");
        }

        let summary = self.syncer.final_upload();
        if summary.errors > 0 {
            tracing::warn!(errors = summary.errors, last_error = ?summary.last_error, "final upload had errors");
        }

        let text = tally.summary();
        tracing::info!("{text}");
        self.notifier
            .send(&format!("ebfleet build for {} finished.", self.prefix), &text);
        Ok(tally)
    }

    fn step(
        &mut self,
        path: &Path,
        recipe: &str,
        tally: &mut Tally,
        installed: &mut HashSet<String>,
    ) -> status::Result<()> {
        let doc = self.status.load()?;
        let plan = match self.planner.plan(path, &doc) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "could not plan, moving on");
                return Ok(());
            }
        };

        // Only skipped records under recheck get this far with history.
        if plan != Plan::Ignore && doc.contains_key(recipe) {
            tracing::info!("rechecking previously skipped recipe");
            self.status.reset(recipe)?;
        }

        match plan {
            Plan::Ignore => {
                if let Some(record) = doc.get(recipe) {
                    tracing::info!(status = %record.status, trydate = %record.trydate, "already attempted");
                }
            }
            Plan::Skip(reason) => {
                tracing::info!(%reason, "skipping");
                self.status.update(recipe, |r| r.mark_skipped(reason))?;
            }
            Plan::Satisfied => {
                tracing::info!("already installed with all dependencies");
                self.status
                    .update(recipe, |r| r.mark_success(SATISFIED_REASON))?;
            }
            Plan::Proceed { spec, missing } => {
                tally.skipped -= 1;
                tracing::info!(missing = missing.len(), "building");
                self.sweep_peers();
                self.download_if_due();

                let execution = self.executor.execute(path, &spec, &missing, installed)?;
                tally.built += execution.built;
                tally.failed.extend(execution.failed);

                if !execution.new_archives.is_empty() {
                    let now = Instant::now();
                    if self.schedule.upload_due(now) {
                        let summary = self.syncer.upload();
                        tracing::info!(
                            transfers = summary.transfers,
                            bytes = summary.bytes,
                            errors = summary.errors,
                            "uploaded"
                        );
                        self.schedule.mark_upload(now);
                    } else {
                        tracing::info!("upload deferred, last one was recent");
                    }
                }
            }
        }
        Ok(())
    }

    fn sweep_peers(&self) {
        let Some(fleet) = &self.fleet else {
            return;
        };
        match fleet.sweep_peers(self.own_instance.as_deref()) {
            Ok(terminated) if !terminated.is_empty() => {
                tracing::warn!(instances = ?terminated, "terminated failed peers");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "peer sweep failed"),
        }
    }

    fn download_if_due(&mut self) {
        let now = Instant::now();
        if !self.schedule.download_due(now) {
            tracing::info!("download skipped, last one was recent");
            return;
        }

        let summary = self.syncer.download_modules();
        tracing::info!(transfers = summary.transfers, errors = summary.errors, "modules downloaded");

        let software = self.syncer.eb_root().join("software");
        match archive::download_untar(self.store, &self.software_key, &software, self.untar_workers) {
            Ok(report) => {
                for (key, error) in &report.failed {
                    tracing::warn!(%key, %error, "archive not extracted");
                }
                tracing::info!(
                    extracted = report.extracted,
                    skipped = report.skipped,
                    failed = report.failed.len(),
                    "archives unpacked"
                );
            }
            Err(e) => tracing::warn!(error = %e, "could not unpack archives"),
        }
        self.schedule.mark_download(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::config::default_min_toolchains;
    use crate::model::{BuildStatus, BuildStatusRecord, MissingModule, MissingModules};
    use crate::planner::ModuleFilter;
    use crate::policy::ToolchainPolicy;
    use crate::status::LocalBucket;
    use crate::testing::{FakeCloud, FakeParser, FakeToolchain, FakeTransfer, RecordingNotifier};

    const KEY: &str = "aws/amzn-2023_graviton-3/eb-build-status.json";
    const BOOST: &str = "Boost-1.82.0-GCC-12.3.0.eb";
    const OLD_BOOST: &str = "Boost-1.79.0-GCC-11.3.0.eb";
    const ZLIB: &str = "zlib-1.3-GCCcore-12.3.0.eb";
    const ANCIENT: &str = "bzip2-1.0.6-GCC-4.9.2.eb";

    struct World {
        dir: TempDir,
        parser: FakeParser,
        toolchain: FakeToolchain,
        bucket: LocalBucket,
        transfer: FakeTransfer,
        cloud: FakeCloud,
        notifier: RecordingNotifier,
        policy: ToolchainPolicy,
        filter: ModuleFilter,
    }

    fn recipe(dir: &TempDir, rel: &str, file: &str) {
        let path = dir.path().join("recipes").join(rel);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(file), "").unwrap();
    }

    fn world() -> World {
        let dir = TempDir::new().unwrap();
        recipe(&dir, "b/Boost", BOOST);
        recipe(&dir, "b/Boost", OLD_BOOST);
        recipe(&dir, "z/zlib", ZLIB);
        recipe(&dir, "b/bzip2", ANCIENT);
        fs::create_dir_all(dir.path().join("recipes/e/empty")).unwrap();

        let mut parser = FakeParser::default();
        parser.add(BOOST, "Boost", "1.82.0", ("GCC", "12.3.0"));
        parser.add(OLD_BOOST, "Boost", "1.79.0", ("GCC", "11.3.0"));
        parser.add(ZLIB, "zlib", "1.3", ("GCCcore", "12.3.0"));
        parser.add(ANCIENT, "bzip2", "1.0.6", ("GCC", "4.9.2"));

        let toolchain = FakeToolchain::default();
        toolchain.set_missing(
            BOOST,
            MissingModules(vec![
                MissingModule {
                    module: "zlib/1.3-GCCcore-12.3.0".into(),
                    recipe: ZLIB.into(),
                },
                MissingModule {
                    module: "Boost/1.82.0-GCC-12.3.0".into(),
                    recipe: BOOST.into(),
                },
            ]),
        );

        let bucket = LocalBucket::new(dir.path().join("bucket")).unwrap();
        World {
            parser,
            toolchain,
            bucket,
            transfer: FakeTransfer::default(),
            cloud: FakeCloud::default(),
            notifier: RecordingNotifier::default(),
            policy: ToolchainPolicy::new(&default_min_toolchains()),
            filter: ModuleFilter::default(),
            dir,
        }
    }

    fn run(w: &World, recheck: bool) -> Tally {
        let catalog = RecipeCatalog::new(w.dir.path().join("recipes"), &w.parser);
        let store = StatusStore::new(&w.bucket, KEY);
        let eb_root = w.dir.path().join("eb");
        let mut orchestrator = Orchestrator {
            catalog: &catalog,
            planner: BuildPlanner {
                policy: &w.policy,
                filter: &w.filter,
                catalog: &catalog,
                toolchain: &w.toolchain,
                recheck_skipped: recheck,
            },
            executor: BuildExecutor {
                toolchain: &w.toolchain,
                status: &store,
                catalog: &catalog,
                os_packages: None,
                eb_root: eb_root.clone(),
            },
            status: &store,
            store: &w.bucket,
            syncer: Syncer::new(&w.transfer, &eb_root, w.dir.path(), "cache/aws", "amzn-2023_graviton-3"),
            schedule: SyncSchedule::new(Duration::from_secs(3600)),
            fleet: Some(FleetController::new(&w.cloud)),
            own_instance: Some("i-self".into()),
            notifier: &w.notifier,
            prefix: "amzn-2023_graviton-3".into(),
            software_key: "aws/amzn-2023_graviton-3/software".into(),
            untar_workers: 2,
        };
        orchestrator.run().unwrap()
    }

    fn record(w: &World, recipe: &str) -> Option<BuildStatusRecord> {
        StatusStore::new(&w.bucket, KEY).get(recipe).unwrap()
    }

    #[test]
    fn pass_builds_newest_recipes_and_records_outcomes() {
        let w = world();
        let tally = run(&w, false);

        // Boost (with zlib as dependency), bzip2 skipped, zlib already built.
        assert_eq!(tally.tried, 3);
        assert_eq!(tally.skipped, 2);
        assert_eq!(tally.built, 1);
        assert!(tally.failed.is_empty());

        assert_eq!(record(&w, BOOST).unwrap().status, BuildStatus::Success);
        assert!(record(&w, OLD_BOOST).is_none());
        let zlib = record(&w, ZLIB).unwrap();
        assert_eq!(zlib.status, BuildStatus::Success);
        assert_eq!(zlib.reason, BUILT_REASON);
        let bzip2 = record(&w, ANCIENT).unwrap();
        assert_eq!(bzip2.status, BuildStatus::Skipped);
        assert!(bzip2.reason.contains("too old"));
    }

    #[test]
    fn pass_ends_with_upload_and_notification() {
        let w = world();
        let tally = run(&w, false);

        let calls = w.transfer.calls();
        let downloads = calls.iter().filter(|(src, _, _)| src.starts_with(":s3:")).count();
        assert_eq!(downloads, 1);
        assert!(calls.last().unwrap().2.contains(&"--checksum".to_string()));

        let sent = w.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ebfleet build for amzn-2023_graviton-3 finished.");
        assert_eq!(sent[0].1, tally.summary());
    }

    #[test]
    fn second_pass_ignores_recorded_recipes() {
        let w = world();
        run(&w, false);
        let builds = w.toolchain.builds().len();
        let queries = w.toolchain.query_count();

        let tally = run(&w, false);
        assert_eq!(tally.tried, 3);
        assert_eq!(tally.skipped, 3);
        assert_eq!(w.toolchain.builds().len(), builds);
        assert_eq!(w.toolchain.query_count(), queries);
    }

    #[test]
    fn recheck_gives_skipped_recipes_a_fresh_record() {
        let w = world();
        let store = StatusStore::new(&w.bucket, KEY);
        store
            .update(ANCIENT, |r| {
                r.mark_skipped("toolchain not supported: GCC");
                r.errorcount = 3;
            })
            .unwrap();

        run(&w, true);
        let bzip2 = record(&w, ANCIENT).unwrap();
        assert_eq!(bzip2.status, BuildStatus::Skipped);
        assert_eq!(bzip2.errorcount, 0);
        assert!(bzip2.reason.contains("too old"));
    }

    #[test]
    fn failed_build_is_listed_in_summary() {
        let w = world();
        w.toolchain.fail_build(BOOST);
        let tally = run(&w, false);
        assert_eq!(tally.failed, [BOOST]);
        assert!(tally.summary().ends_with(&format!("Failed recipes: {BOOST}")));
        assert_eq!(record(&w, BOOST).unwrap().status, BuildStatus::Error);
    }

    #[test]
    fn failed_peers_are_swept_before_building() {
        let w = world();
        w.cloud.add_instance("i-self", "1.1.1.1", None);
        w.cloud.add_instance("i-dead", "2.2.2.2", Some("impaired"));
        run(&w, false);
        assert_eq!(w.cloud.terminated(), ["i-dead"]);
    }

    #[test]
    fn pass_with_nothing_to_build_still_sweeps_peers() {
        let w = world();
        let store = StatusStore::new(&w.bucket, KEY);
        for recipe in [BOOST, ZLIB, ANCIENT] {
            store.update(recipe, |r| r.mark_success(BUILT_REASON)).unwrap();
        }
        w.cloud.add_instance("i-self", "1.1.1.1", None);
        w.cloud.add_instance("i-dead", "2.2.2.2", Some("impaired"));
        w.cloud.add_instance("i-fine", "3.3.3.3", Some("passed"));

        let tally = run(&w, false);
        assert_eq!(tally.skipped, tally.tried);
        assert!(w.toolchain.builds().is_empty());
        assert_eq!(w.cloud.terminated(), ["i-dead"]);
    }

    #[test]
    fn tally_line() {
        let tally = Tally {
            tried: 10,
            skipped: 7,
            built: 2,
            failed: vec!["a.eb".into()],
        };
        assert_eq!(
            tally.to_string(),
            "10 newest recipes (7 skipped), 2 packages built, 1 builds failed"
        );
        assert_eq!(
            tally.summary(),
            "BUILD FINISHED. Tried 10 newest recipes (7 skipped), 2 packages built, 1 builds failed\nFailed recipes: a.eb"
        );
    }
}
