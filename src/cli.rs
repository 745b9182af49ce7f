//! Command-line interface for ebfleet.
//!
//! One binary serves both sides of the fleet: the operator's machine
//! (`launch`, `instances`, `terminate`, `status`) and the worker itself
//! (`build`, `monitor`, `download`, `untar`). Every subcommand is
//! non-interactive.

mod format;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use jiff::Zoned;

use crate::archive;
use crate::catalog::{EasyconfigParser, RecipeCatalog};
use crate::config::Config;
use crate::context::Context;
use crate::executor::{BuildExecutor, OsPackages};
use crate::fleet::{self, AwsCli, Bootstrap, FleetController, LaunchOptions, Target};
use crate::monitor::{IdleLog, IdleMonitor, ProcProbe, SystemProbe, Verdict};
use crate::notify::SesNotifier;
use crate::orchestrator::Orchestrator;
use crate::osdeps::SystemInstaller;
use crate::planner::{BuildPlanner, ModuleFilter};
use crate::platform::{self, OsRelease};
use crate::policy::ToolchainPolicy;
use crate::status::{S3Bucket, StatusStore, StatusSummary};
use crate::toolchain::EasyBuild;
use crate::transfer::{Rclone, SyncSchedule, Syncer};

use format::{format_instance_row, format_launched, format_summary, format_untar};

/// Parallel archive extractions per vCPU; extraction is mostly I/O bound.
const UNTAR_WORKERS_PER_VCPU: usize = 50;

/// ebfleet: build EasyBuild recipes on self-terminating AWS workers.
#[derive(Debug, Parser)]
#[command(name = "ebfleet", version, after_long_help = WORKFLOW_HELP)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

const WORKFLOW_HELP: &str = r"Workflow:
  1. ebfleet launch --cpu-type graviton-3 --vcpus 8 --mem-gb 16
     → prints the instance id; the worker builds, then terminates itself
  2. ebfleet instances
  3. ebfleet status amzn-2023_graviton-3

On a worker:
  ebfleet build --cpu-type graviton-3 --exclude lib
  ebfleet monitor                      (hourly from cron)";

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the newest recipe of every directory in the recipe tree.
    ///
    /// Outcomes go to the shared status file of this platform, so an
    /// interrupted pass picks up where it stopped.
    Build {
        #[command(flatten)]
        platform: PlatformArgs,

        /// Only build these module classes (comma-separated).
        #[arg(long)]
        include: Option<String>,

        /// Never build these module classes (comma-separated).
        /// Ignored when `--include` is given.
        #[arg(long)]
        exclude: Option<String>,

        /// Retry recipes previously recorded as skipped.
        #[arg(long)]
        check_skipped: bool,

        /// Compare transfers by size only, even the first and last time.
        #[arg(long)]
        no_checksums: bool,
    },

    /// Launch a worker on the cheapest instance that fits.
    ///
    /// Exits 3 when capacity is short and 4 when the image needs a
    /// marketplace subscription.
    Launch {
        #[command(flatten)]
        target: TargetArgs,

        /// Use this instance type instead of searching.
        #[arg(long)]
        instance_type: Option<String>,

        /// Pin the availability zone.
        #[arg(long)]
        az: Option<String>,

        /// Launch on-demand even when spot is cheaper.
        #[arg(long)]
        on_demand: bool,

        /// Image to boot. Defaults to the latest Amazon Linux 2023 for the CPU.
        #[arg(long)]
        image_id: Option<String>,

        /// EC2 key pair for SSH access.
        #[arg(long)]
        key_name: Option<String>,

        /// Instance profile granting the worker bucket and EC2 access.
        #[arg(long)]
        iam_profile: Option<String>,

        /// Root volume size.
        #[arg(long, default_value_t = 100)]
        disk_gib: u32,

        /// Login user on the image.
        #[arg(long, default_value = "ec2-user")]
        user: String,

        /// Shell line that installs ebfleet on the worker.
        #[arg(long)]
        install: Option<String>,

        /// Extra arguments for `ebfleet build` on the worker.
        #[arg(last = true)]
        build_args: Vec<String>,
    },

    /// Take one idle sample and terminate this worker when idle long enough.
    ///
    /// Meant to run hourly from cron. Late at night it also emails a
    /// cost report.
    Monitor,

    /// Summarize the build status file of a platform prefix.
    Status {
        /// Platform prefix, e.g. `amzn-2023_graviton-3`.
        prefix: String,

        /// Print one recipe's record as JSON instead.
        #[arg(long)]
        recipe: Option<String>,
    },

    /// Fetch modules and unpack software archives for this platform.
    Download {
        #[command(flatten)]
        platform: PlatformArgs,
    },

    /// List running fleet instances with uptime and health.
    Instances,

    /// Terminate a fleet instance by id or public IP.
    Terminate {
        /// Instance id (`i-...`) or public IPv4 address.
        target: String,
    },

    /// Unpack every `.eb.tar.gz` under a directory in place.
    Untar {
        dir: PathBuf,
    },
}

/// Hardware the platform prefix is named after.
#[derive(Debug, Clone, Args)]
pub struct PlatformArgs {
    /// CPU type, e.g. `graviton-3`, `epyc-4`, `xeon-4`.
    #[arg(long)]
    cpu_type: String,

    /// GPU type, e.g. `h100`.
    #[arg(long)]
    gpu_type: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    #[command(flatten)]
    platform: PlatformArgs,

    /// Minimum vCPUs.
    #[arg(long, default_value_t = 4)]
    vcpus: u32,

    /// Minimum memory in GB.
    #[arg(long, default_value_t = 8)]
    mem_gb: u32,
}

/// A failed command: message for stderr and the process exit status.
#[derive(Debug)]
pub struct Failure {
    pub message: String,
    pub code: i32,
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self { message, code: 1 }
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        message.to_string().into()
    }
}

/// Run the CLI.
pub fn run(config: &Config) -> Result<(), Failure> {
    let cli = Cli::parse();
    let ctx = Context::from_config(config);

    match cli.command {
        Command::Build {
            platform,
            include,
            exclude,
            check_skipped,
            no_checksums,
        } => {
            let filter = ModuleFilter::from_lists(include.as_deref(), exclude.as_deref());
            cmd_build(config, &ctx, &platform, &filter, check_skipped, no_checksums)?;
        }
        Command::Launch {
            target,
            instance_type,
            az,
            on_demand,
            image_id,
            key_name,
            iam_profile,
            disk_gib,
            user,
            install,
            build_args,
        } => {
            let options = LaunchOptions {
                instance_type,
                availability_zone: az,
                on_demand,
                image_id,
                key_name,
                iam_profile,
                disk_gib,
            };
            cmd_launch(&ctx, &target, &options, user, install, build_args)?;
        }
        Command::Monitor => cmd_monitor(config, &ctx)?,
        Command::Status { prefix, recipe } => cmd_status(config, &ctx, &prefix, recipe.as_deref())?,
        Command::Download { platform } => cmd_download(config, &ctx, &platform)?,
        Command::Instances => cmd_instances(&ctx)?,
        Command::Terminate { target } => cmd_terminate(&ctx, &target)?,
        Command::Untar { dir } => cmd_untar(config, &dir)?,
    }
    Ok(())
}

/// The platform prefix of this machine.
fn resolve_prefix(platform: &PlatformArgs) -> Result<(OsRelease, String), String> {
    let release = OsRelease::load().ok_or("could not read /etc/os-release")?;
    let prefix = platform::platform_prefix(&release, &platform.cpu_type, platform.gpu_type.as_deref())
        .ok_or("os-release lacks ID or VERSION_ID, cannot name the platform")?;
    Ok((release, prefix))
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {e}", path.display()))
}

fn untar_workers(config: &Config) -> usize {
    config.vcpus.max(1) * UNTAR_WORKERS_PER_VCPU
}

fn cmd_build(
    config: &Config,
    ctx: &Context,
    platform: &PlatformArgs,
    filter: &ModuleFilter,
    check_skipped: bool,
    no_checksums: bool,
) -> Result<(), String> {
    let (release, prefix) = resolve_prefix(platform)?;
    let recipe_root = config
        .recipe_root()
        .ok_or("could not determine home directory")?;
    let home = dirs::home_dir().ok_or("could not determine home directory")?;
    ensure_dir(&config.eb_root.join("tmp"))?;
    ensure_dir(&config.eb_root.join("software"))?;

    let bucket = S3Bucket::new(&config.bucket, ctx.clone());
    let status = StatusStore::new(&bucket, config.status_key(&prefix));
    let parser = EasyconfigParser::new();
    let catalog = RecipeCatalog::new(recipe_root, &parser);
    let toolchain = EasyBuild::new(ctx, &config.eb_root);
    let policy = ToolchainPolicy::new(&config.min_toolchains);
    let installer = release.family().map(|family| (SystemInstaller::new(family), family));
    let rclone = Rclone::new(&config.rclone, ctx.clone(), config.vcpus);
    let mut syncer = Syncer::new(&rclone, &config.eb_root, home, &config.archive_path(), &prefix);
    if no_checksums {
        syncer = syncer.size_only();
    }
    let cloud = AwsCli::new(ctx.clone());
    let notifier = SesNotifier::new(ctx.clone(), config.email.clone());
    let own_instance = ProcProbe::default().metadata("instance-id");
    if own_instance.is_none() {
        tracing::info!("no instance metadata, not running on a fleet worker");
    }

    let mut orchestrator = Orchestrator {
        catalog: &catalog,
        planner: BuildPlanner {
            policy: &policy,
            filter,
            catalog: &catalog,
            toolchain: &toolchain,
            recheck_skipped: check_skipped,
        },
        executor: BuildExecutor {
            toolchain: &toolchain,
            status: &status,
            catalog: &catalog,
            os_packages: installer.as_ref().map(|(installer, family)| OsPackages {
                installer,
                family: *family,
            }),
            eb_root: config.eb_root.clone(),
        },
        status: &status,
        store: &bucket,
        syncer,
        schedule: SyncSchedule::new(Duration::from_secs(config.copy_delay_secs)),
        fleet: Some(FleetController::new(&cloud)),
        own_instance,
        notifier: &notifier,
        software_key: format!("{}/{prefix}/software", config.archive_root),
        prefix,
        untar_workers: untar_workers(config),
    };

    let tally = orchestrator
        .run()
        .map_err(|e| format!("status file unusable, stopping: {e}"))?;
    println!("{}", tally.summary());
    Ok(())
}

fn cmd_launch(
    ctx: &Context,
    args: &TargetArgs,
    options: &LaunchOptions,
    user: String,
    install: Option<String>,
    extra: Vec<String>,
) -> Result<(), Failure> {
    let target = Target {
        cpu_type: args.platform.cpu_type.clone(),
        gpu_type: args.platform.gpu_type.clone(),
        vcpus: args.vcpus,
        mem_gb: args.mem_gb,
    };

    let mut build_args = vec!["--cpu-type".to_string(), target.cpu_type.clone()];
    if let Some(gpu) = &target.gpu_type {
        build_args.extend(["--gpu-type".to_string(), gpu.clone()]);
    }
    build_args.extend(extra);
    let user_data = fleet::bootstrap_script(&Bootstrap {
        build_args,
        install,
        user,
    });

    let cloud = AwsCli::new(ctx.clone());
    let launched = FleetController::new(&cloud)
        .launch(&target, options, &user_data)
        .map_err(|e| Failure {
            message: format!("launch failed: {e}"),
            code: e.exit_code(),
        })?;

    eprintln!("{}", format_launched(&launched));
    println!("{}", launched.instance_id);
    Ok(())
}

fn cmd_monitor(config: &Config, ctx: &Context) -> Result<(), String> {
    let probe = ProcProbe::default();
    let cloud = AwsCli::new(ctx.clone());
    let notifier = SesNotifier::new(ctx.clone(), config.email.clone());
    let monitor = IdleMonitor {
        probe: &probe,
        cloud: &cloud,
        notifier: &notifier,
        log: IdleLog::new(config.monitor.state_file()),
        window: Duration::from_secs(config.monitor.interval_secs),
        min_idle: config.monitor.min_idle_count,
    };

    let verdict = monitor
        .run(&Zoned::now())
        .map_err(|e| format!("monitor failed: {e}"))?;
    match verdict {
        Verdict::Active(reason) => println!("active: {reason}"),
        Verdict::IdleCandidate(count) => {
            println!("idle {count}/{}", config.monitor.min_idle_count);
        }
        Verdict::Terminated => println!("terminated"),
    }
    Ok(())
}

fn cmd_status(
    config: &Config,
    ctx: &Context,
    prefix: &str,
    recipe: Option<&str>,
) -> Result<(), String> {
    let bucket = S3Bucket::new(&config.bucket, ctx.clone());
    let status = StatusStore::new(&bucket, config.status_key(prefix));

    if let Some(recipe) = recipe {
        let record = status
            .get(recipe)
            .map_err(|e| format!("failed to read {}: {e}", status.key()))?
            .ok_or_else(|| format!("no record for {recipe}"))?;
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| format!("failed to serialize record: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let doc = status
        .load()
        .map_err(|e| format!("failed to read {}: {e}", status.key()))?;
    if doc.is_empty() {
        println!("No records at {}", status.key());
        return Ok(());
    }
    print!("{}", format_summary(&StatusSummary::from_document(&doc)));
    Ok(())
}

fn cmd_download(config: &Config, ctx: &Context, platform: &PlatformArgs) -> Result<(), String> {
    let (_, prefix) = resolve_prefix(platform)?;
    let home = dirs::home_dir().ok_or("could not determine home directory")?;
    let software = config.eb_root.join("software");
    ensure_dir(&software)?;

    let rclone = Rclone::new(&config.rclone, ctx.clone(), config.vcpus);
    let mut syncer = Syncer::new(&rclone, &config.eb_root, home, &config.archive_path(), &prefix);
    let modules = syncer.download_modules();
    eprintln!(
        "modules: {} transfers, {} errors",
        modules.transfers, modules.errors
    );

    let bucket = S3Bucket::new(&config.bucket, ctx.clone());
    let key = format!("{}/{prefix}/software", config.archive_root);
    let report = archive::download_untar(&bucket, &key, &software, untar_workers(config))
        .map_err(|e| format!("failed to list {key}: {e}"))?;
    println!("{}", format_untar(&report));
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} archives failed to extract", report.failed.len()))
    }
}

fn cmd_instances(ctx: &Context) -> Result<(), String> {
    let cloud = AwsCli::new(ctx.clone());
    let rows = FleetController::new(&cloud)
        .list_instances()
        .map_err(|e| format!("failed to list instances: {e}"))?;

    if rows.is_empty() {
        println!("No running instances");
        return Ok(());
    }
    for row in &rows {
        println!("{}", format_instance_row(row));
    }
    Ok(())
}

fn cmd_terminate(ctx: &Context, target: &str) -> Result<(), String> {
    let cloud = AwsCli::new(ctx.clone());
    match FleetController::new(&cloud).terminate(target) {
        Ok(Some(id)) => {
            println!("terminated {id}");
            Ok(())
        }
        Ok(None) => Err(format!("no instance with public IP {target}")),
        Err(e) => Err(format!("failed to terminate {target}: {e}")),
    }
}

fn cmd_untar(config: &Config, dir: &Path) -> Result<(), String> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    let report = archive::untar_tree(dir, untar_workers(config));
    println!("{}", format_untar(&report));
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} archives failed to extract", report.failed.len()))
    }
}
