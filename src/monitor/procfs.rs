//! `SystemProbe` reading Linux `/proc`, plus the EC2 instance metadata
//! service through `curl`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use super::{MonitorError, Result, Sample, SystemProbe};

const METADATA: &str = "http://169.254.169.254/latest";
const SECTOR_BYTES: u64 = 512;

/// Cumulative counters at one instant.
#[derive(Debug, Default)]
struct Snapshot {
    cpu: CpuTimes,
    disk_written: u64,
    net_recv: u64,
    net_sent: u64,
    processes: HashMap<u32, ProcessTimes>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
    cpus: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessTimes {
    name: String,
    ticks: u64,
}

pub struct ProcProbe {
    root: PathBuf,
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).map_err(|source| MonitorError::Io { path, source })
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let cpu = parse_cpu_times(&self.read("stat")?)
            .ok_or_else(|| MonitorError::Probe("no cpu line in stat".into()))?;
        let disk_written = parse_diskstats(&self.read("diskstats")?, |name| {
            Path::new("/sys/block").join(name).exists() && !is_virtual_disk(name)
        });
        let (net_recv, net_sent) = parse_net_dev(&self.read("net/dev")?);

        Ok(Snapshot {
            cpu,
            disk_written,
            net_recv,
            net_sent,
            processes: self.processes(),
        })
    }

    fn pids(&self) -> Vec<u32> {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Processes vanish between listing and reading; those are skipped.
    fn processes(&self) -> HashMap<u32, ProcessTimes> {
        self.pids()
            .into_iter()
            .filter_map(|pid| {
                let stat = fs::read_to_string(self.root.join(format!("{pid}/stat"))).ok()?;
                parse_process_stat(&stat).map(|t| (pid, t))
            })
            .collect()
    }

    /// Names of processes whose `io` shows bytes written. Unreadable
    /// entries, usually other users' processes, are skipped.
    fn writers(&self, pids: impl Iterator<Item = (u32, String)>) -> Vec<String> {
        pids.filter(|(pid, _)| {
            fs::read_to_string(self.root.join(format!("{pid}/io")))
                .ok()
                .and_then(|io| parse_write_bytes(&io))
                .is_some_and(|bytes| bytes > 0)
        })
        .map(|(_, name)| name)
        .collect()
    }
}

fn users_logged_in() -> bool {
    match Command::new("who").output() {
        Ok(output) => !output.stdout.iter().all(u8::is_ascii_whitespace),
        Err(e) => {
            tracing::warn!(error = %e, "could not run who, assuming a user is logged in");
            true
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_second(before: u64, after: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64().max(1.0);
    after.saturating_sub(before) as f64 / secs
}

impl SystemProbe for ProcProbe {
    #[allow(clippy::cast_precision_loss)]
    fn sample(&self, window: Duration) -> Result<Sample> {
        let users_logged_in = users_logged_in();
        let before = self.snapshot()?;
        thread::sleep(window);
        let after = self.snapshot()?;

        let total = after.cpu.total.saturating_sub(before.cpu.total).max(1) as f64;
        let busy = after.cpu.busy.saturating_sub(before.cpu.busy) as f64;
        let cpus = after.cpu.cpus.max(1) as f64;

        let processes: Vec<(String, f64)> = after
            .processes
            .iter()
            .map(|(pid, now)| {
                let then = before.processes.get(pid).map_or(0, |p| p.ticks);
                let used = now.ticks.saturating_sub(then) as f64;
                (now.name.clone(), used / total * 100.0 * cpus)
            })
            .collect();

        let writers = self.writers(
            after
                .processes
                .iter()
                .map(|(pid, p)| (*pid, p.name.clone())),
        );

        Ok(Sample {
            users_logged_in,
            cpu_percent: busy / total * 100.0,
            disk_write_bps: per_second(before.disk_written, after.disk_written, window),
            net_sent_bps: per_second(before.net_sent, after.net_sent, window),
            net_recv_bps: per_second(before.net_recv, after.net_recv, window),
            writers,
            processes,
        })
    }

    /// IMDSv2: fetch a session token, then the entry.
    fn metadata(&self, entry: &str) -> Option<String> {
        let token = curl(&[
            "-X",
            "PUT",
            &format!("{METADATA}/api/token"),
            "-H",
            "X-aws-ec2-metadata-token-ttl-seconds: 60",
        ])?;
        curl(&[
            "-H",
            &format!("X-aws-ec2-metadata-token: {token}"),
            &format!("{METADATA}/meta-data/{entry}"),
        ])
    }
}

fn curl(args: &[&str]) -> Option<String> {
    let output = Command::new("curl")
        .args(["-sf", "--max-time", "2"])
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::debug!(?args, "metadata request failed");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

// ── Parsers ──

/// Aggregate `cpu` line of `/proc/stat`. Idle and iowait count as not busy.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let mut times = None;
    let mut cpus = 0;
    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("cpu") => {
                let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
                let total: u64 = values.iter().take(8).sum();
                let idle = values.get(3).copied().unwrap_or(0) + values.get(4).copied().unwrap_or(0);
                times = Some((total.saturating_sub(idle), total));
            }
            Some(name) if name.starts_with("cpu") => cpus += 1,
            _ => {}
        }
    }
    times.map(|(busy, total)| CpuTimes { busy, total, cpus })
}

/// Bytes written to the disks `include` accepts, from `/proc/diskstats`.
fn parse_diskstats(diskstats: &str, include: impl Fn(&str) -> bool) -> u64 {
    diskstats
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let name = *fields.get(2)?;
            let sectors: u64 = fields.get(9)?.parse().ok()?;
            include(name).then_some(sectors * SECTOR_BYTES)
        })
        .sum()
}

fn is_virtual_disk(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram")
}

/// Received and sent bytes over all interfaces except loopback.
fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    net_dev
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(iface, _)| iface.trim() != "lo")
        .filter_map(|(_, counters)| {
            let fields: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            Some((*fields.first()?, *fields.get(8)?))
        })
        .fold((0, 0), |(recv, sent), (r, s)| (recv + r, sent + s))
}

/// Name and user+system ticks from `/proc/<pid>/stat`.
///
/// The name is parenthesised and may itself contain spaces or parens, so
/// fields are counted from the last `)`.
fn parse_process_stat(stat: &str) -> Option<ProcessTimes> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is the state; utime and stime are fields 14 and 15 overall.
    let utime: u64 = rest.get(11)?.parse().ok()?;
    let stime: u64 = rest.get(12)?.parse().ok()?;
    Some(ProcessTimes {
        name,
        ticks: utime + stime,
    })
}

fn parse_write_bytes(io: &str) -> Option<u64> {
    io.lines()
        .find_map(|line| line.strip_prefix("write_bytes:"))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    const STAT: &str = "\
cpu  100 0 50 800 50 0 0 0 0 0
cpu0 50 0 25 400 25 0 0 0 0 0
cpu1 50 0 25 400 25 0 0 0 0 0
intr 12345
ctxt 999
";

    #[test]
    fn cpu_times() {
        let times = parse_cpu_times(STAT).unwrap();
        assert_eq!(
            times,
            CpuTimes {
                busy: 150,
                total: 1000,
                cpus: 2
            }
        );
        assert!(parse_cpu_times("intr 1\n").is_none());
    }

    #[test]
    fn net_dev_skips_loopback() {
        let net = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 9999 10 0 0 0 0 0 0 9999 10 0 0 0 0 0 0
  ens5: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0
docker0: 5 1 0 0 0 0 0 0 7 1 0 0 0 0 0 0
";
        assert_eq!(parse_net_dev(net), (1005, 2007));
    }

    #[test]
    fn diskstats_counts_selected_disks() {
        let stats = "\
 259       0 nvme0n1 100 0 2000 50 300 0 4000 60 0 100 110 0 0 0 0
 259       1 nvme0n1p1 90 0 1800 40 290 0 3900 55 0 90 95 0 0 0 0
   7       0 loop0 10 0 20 1 0 0 0 0 0 1 1 0 0 0 0
";
        assert_eq!(parse_diskstats(stats, |n| n == "nvme0n1"), 4000 * 512);
    }

    #[test]
    fn process_stat_with_awkward_name() {
        let stat = "4242 (tmux: server (1)) S 1 4242 4242 0 -1 4194560 300 0 0 0 17 4 0 0 20 0 1 0 100 1000 50";
        let times = parse_process_stat(stat).unwrap();
        assert_eq!(times.name, "tmux: server (1)");
        assert_eq!(times.ticks, 21);
    }

    #[test]
    fn io_write_bytes() {
        let io = "rchar: 10\nwchar: 20\nread_bytes: 0\nwrite_bytes: 4096\ncancelled_write_bytes: 0\n";
        assert_eq!(parse_write_bytes(io), Some(4096));
        assert_eq!(parse_write_bytes("rchar: 1\n"), None);
    }

    #[test]
    fn sample_from_fake_proc_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("stat"), STAT).unwrap();
        fs::write(root.join("diskstats"), "").unwrap();
        fs::create_dir_all(root.join("net")).unwrap();
        fs::write(root.join("net/dev"), "  lo: 1 0 0 0 0 0 0 0 1 0 0 0 0 0 0 0\n").unwrap();
        fs::create_dir_all(root.join("77")).unwrap();
        fs::write(
            root.join("77/stat"),
            "77 (make) R 1 77 77 0 -1 0 0 0 0 0 30 10 0 0 20 0 1 0 100 1000 50",
        )
        .unwrap();
        fs::write(root.join("77/io"), "write_bytes: 8192\n").unwrap();

        let sample = ProcProbe::new(root).sample(Duration::ZERO).unwrap();
        assert!(sample.cpu_percent.abs() < f64::EPSILON);
        assert!(sample.net_recv_bps.abs() < f64::EPSILON);
        assert_eq!(sample.writers, ["make"]);
        assert_eq!(sample.processes.len(), 1);
        assert_eq!(sample.processes[0].0, "make");
    }
}
