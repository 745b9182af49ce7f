//! Idle detection for workers.
//!
//! Run periodically (hourly from cron). Each run samples system activity
//! for one window and appends `1` (idle) or `0` (active) to a local log.
//! Once the trailing run of idle samples is long enough, or the instance
//! fails its own reachability check, the worker notifies and terminates
//! itself. Late in the evening it also mails a cost report.

pub mod procfs;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use jiff::civil::Date;
use jiff::Zoned;

use crate::fleet::{CloudApi, CloudError, Cost, CostQuery, FleetController, Granularity};
use crate::notify::Notifier;

pub use procfs::ProcProbe;

pub const CPU_THRESHOLD: f64 = 20.0;
pub const PROCESS_CPU_THRESHOLD: f64 = 10.0;
/// Bytes per second, each direction.
pub const NET_THRESHOLD: f64 = 1000.0;
pub const DISK_WRITE_THRESHOLD: f64 = 100_000.0;

/// System daemons whose activity never keeps a worker alive.
pub const EXCLUDED_PROCESSES: &[&str] = &[
    "systemd",
    "systemd-journald",
    "chronyd",
    "sshd",
    "auditd",
    "agetty",
];

const TERMINATED: &str = "T";

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("could not sample system activity: {0}")]
    Probe(String),

    #[error("instance metadata unavailable, cannot identify this worker")]
    NoIdentity,

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Time(#[from] jiff::Error),
}

pub type Result<T> = core::result::Result<T, MonitorError>;

// ── Sampling ──

/// Activity over one sampling window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub users_logged_in: bool,
    pub cpu_percent: f64,
    pub disk_write_bps: f64,
    pub net_sent_bps: f64,
    pub net_recv_bps: f64,
    /// Processes that have written to disk.
    pub writers: Vec<String>,
    /// Per-process CPU percent of one core over the window.
    pub processes: Vec<(String, f64)>,
}

pub trait SystemProbe {
    /// Measure activity over `window`, blocking for its duration.
    fn sample(&self, window: Duration) -> Result<Sample>;

    /// An instance metadata entry such as `instance-id`.
    fn metadata(&self, entry: &str) -> Option<String>;
}

/// Why a sample counts as active, or `None` when idle.
pub fn activity(sample: &Sample) -> Option<String> {
    let counted = |name: &String| !EXCLUDED_PROCESSES.contains(&name.as_str());

    if sample.users_logged_in {
        return Some("users logged in".into());
    }
    if sample.cpu_percent > CPU_THRESHOLD {
        return Some(format!("CPU {:.1}%", sample.cpu_percent));
    }
    if sample.disk_write_bps > DISK_WRITE_THRESHOLD
        && let Some(writer) = sample.writers.iter().find(|w| counted(w))
    {
        return Some(format!(
            "disk writes {:.0} B/s by {writer}",
            sample.disk_write_bps
        ));
    }
    if sample.net_sent_bps > NET_THRESHOLD || sample.net_recv_bps > NET_THRESHOLD {
        return Some(format!(
            "network {:.0} B/s out, {:.0} B/s in",
            sample.net_sent_bps, sample.net_recv_bps
        ));
    }
    sample
        .processes
        .iter()
        .find(|(name, cpu)| counted(name) && *cpu > PROCESS_CPU_THRESHOLD)
        .map(|(name, cpu)| format!("{name} at CPU {cpu:.1}%"))
}

// ── Idle log ──

/// Append-only sample log, one `0`/`1` per line, local to this worker.
pub struct IdleLog {
    path: PathBuf,
}

impl IdleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one sample and return the trailing idle count.
    pub fn record(&self, idle: bool) -> Result<usize> {
        self.append(if idle { "1" } else { "0" })?;
        Ok(trailing_idle(&self.read()?))
    }

    pub fn mark_terminated(&self) -> Result<()> {
        self.append(TERMINATED)
    }

    pub fn terminated(&self) -> Result<bool> {
        Ok(self.read()?.lines().next_back().map(str::trim) == Some(TERMINATED))
    }

    fn append(&self, line: &str) -> Result<()> {
        let io_err = |source| MonitorError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{line}").map_err(io_err)
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(MonitorError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Consecutive `1` lines at the end of a log.
pub fn trailing_idle(log: &str) -> usize {
    log.lines()
        .rev()
        .take_while(|line| line.trim() == "1")
        .count()
}

// ── Cost report ──

#[derive(Debug, Clone, PartialEq)]
pub struct CostReport {
    pub user: String,
    pub month: Cost,
    pub user_month: Cost,
    pub user_day: Cost,
    pub day_by_type: Vec<(String, Cost)>,
}

impl CostReport {
    /// Month-to-date and last-24-hour EC2 compute spend as of `today`.
    ///
    /// Spend of the root identity is the whole account's. Other users are
    /// attributed through the `CreatedBy` tag.
    pub fn gather(cloud: &dyn CloudApi, today: Date) -> Result<Self> {
        let arn = cloud.caller_arn()?;
        let is_root = arn.contains(":root");
        let user = if is_root {
            "root".to_string()
        } else {
            arn.rsplit('/').next().unwrap_or(&arn).to_string()
        };

        let end = today.tomorrow()?;
        let month = CostQuery {
            start: today.first_of_month(),
            end,
            granularity: Granularity::Monthly,
            created_by: None,
        };
        let day = CostQuery {
            start: today.yesterday()?,
            end: today,
            granularity: Granularity::Daily,
            created_by: None,
        };

        let month_cost = cloud.cost(&month)?;
        let day_by_type = cloud.cost_by_instance_type(&day)?;

        let (user_month, user_day) = if is_root {
            let amount = day_by_type.iter().map(|(_, c)| c.amount).sum();
            let day_total = Cost {
                amount,
                unit: month_cost.unit.clone(),
            };
            (month_cost.clone(), day_total)
        } else {
            let mine = |q: &CostQuery| CostQuery {
                created_by: Some(user.clone()),
                ..q.clone()
            };
            (cloud.cost(&mine(&month))?, cloud.cost(&mine(&day))?)
        };

        Ok(Self {
            user,
            month: month_cost,
            user_month,
            user_day,
            day_by_type,
        })
    }

    pub fn body(&self) -> String {
        let mut lines = vec![
            format!(
                "{:.2} {} total account cost for the current month.",
                self.month.amount, self.month.unit
            ),
            format!(
                "{:.2} {} cost of user {} for the current month.",
                self.user_month.amount, self.user_month.unit, self.user
            ),
            format!(
                "{:.2} {} cost of user {} in the last 24 hours.",
                self.user_day.amount, self.user_day.unit, self.user
            ),
            "Cost for each EC2 instance type in the last 24 hours:".to_string(),
        ];
        for (instance_type, cost) in &self.day_by_type {
            if instance_type != "NoInstanceType" {
                lines.push(format!(
                    "  {instance_type:12}: ${:.2} {}",
                    cost.amount, cost.unit
                ));
            }
        }
        lines.join("\n")
    }
}

/// Whether `now` falls in the daily report window, 23:00 to 23:59.
pub fn in_report_window(now: &Zoned) -> bool {
    now.hour() == 23
}

// ── Monitor ──

/// Outcome of one monitor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Active(String),
    IdleCandidate(usize),
    Terminated,
}

pub struct IdleMonitor<'a> {
    pub probe: &'a dyn SystemProbe,
    pub cloud: &'a dyn CloudApi,
    pub notifier: &'a dyn Notifier,
    pub log: IdleLog,
    pub window: Duration,
    pub min_idle: usize,
}

impl IdleMonitor<'_> {
    pub fn run(&self, now: &Zoned) -> Result<Verdict> {
        if self.log.terminated()? {
            tracing::info!(log = %self.log.path().display(), "already terminated");
            return Ok(Verdict::Terminated);
        }

        let instance_id = self.probe.metadata("instance-id");
        let public_ip = self.probe.metadata("public-ipv4").unwrap_or_default();
        let _span = tracing::info_span!(
            "monitor",
            instance = instance_id.as_deref().unwrap_or("unknown"),
            ip = %public_ip
        )
        .entered();

        let sample = self.probe.sample(self.window)?;
        let active = activity(&sample);
        let count = self.log.record(active.is_none())?;
        match &active {
            Some(reason) => tracing::info!(%reason, "active"),
            None => tracing::info!(count, min = self.min_idle, "idle"),
        }

        let fleet = FleetController::new(self.cloud);
        let unhealthy = match &instance_id {
            Some(id) => fleet.has_failed(id).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not check own health");
                false
            }),
            None => false,
        };

        if count >= self.min_idle || unhealthy {
            let id = instance_id.ok_or(MonitorError::NoIdentity)?;
            let body = if unhealthy {
                "Instance failed its reachability check and was terminated"
            } else {
                "Instance was detected as idle and terminated"
            };
            self.notifier.send(
                &format!("Terminating idle instance {public_ip} ({id})"),
                body,
            );
            fleet.terminate(&id)?;
            self.log.mark_terminated()?;
            return Ok(Verdict::Terminated);
        }

        if in_report_window(now) {
            match CostReport::gather(self.cloud, now.date()) {
                Ok(report) => {
                    let id = instance_id.as_deref().unwrap_or("unknown");
                    self.notifier
                        .send(&format!("ebfleet cost report ({id})"), &report.body());
                }
                Err(e) => tracing::warn!(error = %e, "cost report failed"),
            }
        }

        Ok(match active {
            Some(reason) => Verdict::Active(reason),
            None => Verdict::IdleCandidate(count),
        })
    }
}
