//! Worker fleet lifecycle: pick the cheapest instance, launch it, and
//! clear out broken peers.
//!
//! Every worker carries the tag `Name=EBFleetSelfDestruct`. Anything with
//! that tag may be terminated by its peers or by itself.

pub mod aws;
pub mod families;

use std::io;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use jiff::civil::Date;
use jiff::{SignedDuration, Timestamp};
use regex::Regex;

pub use aws::AwsCli;

pub const FLEET_TAG_KEY: &str = "Name";
pub const FLEET_TAG_VALUE: &str = "EBFleetSelfDestruct";

/// Spot requests are capped at this multiple of the observed price, and
/// on-demand wins unless it costs more than spot by the same factor.
pub const SPOT_MARGIN: f64 = 1.05;

const LAUNCH_ATTEMPTS: usize = 2;
const SPOT_HISTORY: SignedDuration = SignedDuration::from_mins(15);

static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+").expect("decimal regex is valid"));

// ── Errors ──

/// A failed cloud API call.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    /// The provider rejected the call with an error code.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("unexpected response: {0}")]
    Response(String),
}

pub type Result<T> = core::result::Result<T, CloudError>;

/// Why a worker could not be launched. Each kind maps to an exit status.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("unknown CPU type {0}, expected one of: {known}", known = families::cpu_types().collect::<Vec<_>>().join(", "))]
    UnknownCpu(String),

    #[error("unknown GPU type: {0}")]
    UnknownGpu(String),

    #[error("no instance type in {families} with {vcpus} vCPUs and {mem_gb} GB")]
    NoInstanceType {
        families: String,
        vcpus: u32,
        mem_gb: u32,
    },

    #[error("no recent spot price for {0}")]
    NoSpotPrice(String),

    #[error("access denied, check IAM permissions: {0}")]
    AccessDenied(String),

    #[error("{0} (accept the offer in the console, then retry)")]
    OptInRequired(String),

    #[error("{0} (try again later, or another zone, or on-demand)")]
    InsufficientCapacity(String),

    #[error("spot price still too low after {0} attempts")]
    SpotPriceTooLow(usize),

    #[error("instance {id} not running after {secs}s")]
    NotRunning { id: String, secs: u64 },

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::OptInRequired(_) => 4,
            Self::InsufficientCapacity(_) => 3,
            _ => 1,
        }
    }

    fn classify(error: CloudError, attempts: usize) -> Self {
        match error {
            CloudError::Api { code, message } => match code.as_str() {
                "AccessDenied" | "UnauthorizedOperation" => Self::AccessDenied(message),
                "OptInRequired" => Self::OptInRequired(message),
                "InsufficientInstanceCapacity" => Self::InsufficientCapacity(message),
                "SpotMaxPriceTooLow" => Self::SpotPriceTooLow(attempts),
                _ => Self::Cloud(CloudError::Api { code, message }),
            },
            other => Self::Cloud(other),
        }
    }
}

// ── Cloud API ──

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTypeInfo {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotPrice {
    pub instance_type: String,
    pub availability_zone: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub instance_type: String,
    pub public_ip: Option<String>,
    pub launch_time: Timestamp,
}

/// How an instance is paid for.
#[derive(Debug, Clone, PartialEq)]
pub enum Market {
    OnDemand,
    /// One-time spot request, terminated on interruption.
    Spot {
        max_price: f64,
        availability_zone: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X86_64,
}

impl Arch {
    pub fn of_cpu(cpu_type: &str) -> Self {
        if cpu_type.starts_with("graviton") {
            Self::Arm64
        } else {
            Self::X86_64
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::X86_64 => "x86_64",
        }
    }
}

/// Everything `run_instance` needs for one attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub market: Market,
    pub user_data: String,
    pub key_name: Option<String>,
    pub iam_profile: Option<String>,
    /// Extra gp3 volume, none when zero.
    pub disk_gib: u32,
    /// Idempotency token, fresh per attempt.
    pub client_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cost {
    pub amount: f64,
    pub unit: String,
}

/// EC2 compute spend between `start` (inclusive) and `end` (exclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct CostQuery {
    pub start: Date,
    pub end: Date,
    pub granularity: Granularity,
    /// Restrict to resources tagged `CreatedBy=<user>`.
    pub created_by: Option<String>,
}

/// The provider calls the fleet and the monitor make.
pub trait CloudApi {
    /// Instance types whose family is one of `families`.
    fn instance_types(&self, families: &[&str]) -> Result<Vec<InstanceTypeInfo>>;

    /// Linux spot price history for `instance_types` since `since`.
    fn spot_prices(&self, instance_types: &[String], since: Timestamp) -> Result<Vec<SpotPrice>>;

    /// Hourly on-demand Linux price, `None` when the price list has no entry.
    fn on_demand_price(&self, instance_type: &str) -> Result<Option<f64>>;

    fn latest_image(&self, arch: Arch) -> Result<String>;

    /// Launch one instance tagged with the fleet tag, returning its id.
    fn run_instance(&self, request: &LaunchRequest) -> Result<String>;

    fn tag(&self, instance_id: &str, key: &str, value: &str) -> Result<()>;

    /// Running instances carrying `key=value`.
    fn running_instances(&self, key: &str, value: &str) -> Result<Vec<Instance>>;

    /// State name such as `pending` or `running`, `None` if not found.
    fn instance_state(&self, instance_id: &str) -> Result<Option<String>>;

    /// Reachability check status such as `passed` or `impaired`, `None`
    /// when the provider reports no status.
    fn reachability(&self, instance_id: &str) -> Result<Option<String>>;

    fn instance_by_public_ip(&self, ip: &str) -> Result<Option<String>>;

    fn terminate(&self, instance_id: &str) -> Result<()>;

    fn cost(&self, query: &CostQuery) -> Result<Cost>;

    /// Daily spend over the query window grouped by instance type.
    fn cost_by_instance_type(&self, query: &CostQuery) -> Result<Vec<(String, Cost)>>;

    /// ARN of the calling identity.
    fn caller_arn(&self) -> Result<String>;
}

// ── Launching ──

/// What to run on.
#[derive(Debug, Clone)]
pub struct Target {
    pub cpu_type: String,
    pub gpu_type: Option<String>,
    pub vcpus: u32,
    pub mem_gb: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Skip selection and use this type.
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
    pub on_demand: bool,
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub iam_profile: Option<String>,
    pub disk_gib: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Launched {
    pub instance_id: String,
    pub instance_type: String,
    pub market: Market,
    pub spot_price: f64,
    pub on_demand_price: f64,
}

/// One row of `instances`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRow {
    pub instance: Instance,
    pub uptime: SignedDuration,
    pub healthy: bool,
}

/// The last decimal number in a provider message.
///
/// Spot rejections end with the minimum acceptable price.
pub fn extract_last_price(message: &str) -> Option<f64> {
    DECIMAL
        .find_iter(message)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

/// On-demand when it is within the spot margin or forced, else a capped
/// spot request in `availability_zone`.
pub fn choose_market(
    spot: f64,
    on_demand: f64,
    force_on_demand: bool,
    availability_zone: &str,
) -> Market {
    if force_on_demand || on_demand < spot * SPOT_MARGIN {
        Market::OnDemand
    } else {
        Market::Spot {
            max_price: spot * SPOT_MARGIN,
            availability_zone: availability_zone.to_string(),
        }
    }
}

pub struct FleetController<'a> {
    cloud: &'a dyn CloudApi,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl<'a> FleetController<'a> {
    pub fn new(cloud: &'a dyn CloudApi) -> Self {
        Self {
            cloud,
            wait_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }

    /// Cheapest `(type, zone, price)` for `target` over the last 15 minutes
    /// of spot history.
    pub fn cheapest_spot(&self, target: &Target) -> core::result::Result<SpotPrice, LaunchError> {
        let families: Vec<&str> = match &target.gpu_type {
            Some(gpu) => {
                vec![families::gpu_family(gpu).ok_or_else(|| LaunchError::UnknownGpu(gpu.clone()))?]
            }
            None => families::cpu_families(&target.cpu_type)
                .ok_or_else(|| LaunchError::UnknownCpu(target.cpu_type.clone()))?
                .to_vec(),
        };

        let min_mib = u64::from(target.mem_gb) * 1024;
        let types: Vec<String> = self
            .cloud
            .instance_types(&families)?
            .into_iter()
            .filter(|t| families::in_families(&t.name, &families))
            .filter(|t| t.vcpus >= target.vcpus && t.memory_mib >= min_mib)
            .map(|t| t.name)
            .collect();

        if types.is_empty() {
            return Err(LaunchError::NoInstanceType {
                families: families.join(","),
                vcpus: target.vcpus,
                mem_gb: target.mem_gb,
            });
        }
        tracing::debug!(candidates = ?types, "matching instance types");
        self.cheapest_of(&types)
    }

    fn cheapest_of(&self, types: &[String]) -> core::result::Result<SpotPrice, LaunchError> {
        let since = Timestamp::now() - SPOT_HISTORY;
        self.cloud
            .spot_prices(types, since)?
            .into_iter()
            .min_by(|a, b| a.price.total_cmp(&b.price))
            .ok_or_else(|| LaunchError::NoSpotPrice(types.join(",")))
    }

    /// Launch one worker, tag it, and wait for it to run.
    pub fn launch(
        &self,
        target: &Target,
        options: &LaunchOptions,
        user_data: &str,
    ) -> core::result::Result<Launched, LaunchError> {
        let selection = match &options.instance_type {
            Some(instance_type) => self.cheapest_of(std::slice::from_ref(instance_type))?,
            None => self.cheapest_spot(target)?,
        };

        let on_demand_price = match self.cloud.on_demand_price(&selection.instance_type) {
            Ok(Some(price)) => price,
            Ok(None) => f64::MAX,
            Err(e) => {
                tracing::warn!(error = %e, "no on-demand price, assuming spot is cheaper");
                f64::MAX
            }
        };
        tracing::info!(
            instance_type = %selection.instance_type,
            zone = %selection.availability_zone,
            spot = selection.price,
            on_demand = on_demand_price,
            "selected instance type"
        );

        let zone = options
            .availability_zone
            .clone()
            .unwrap_or_else(|| selection.availability_zone.clone());
        let image_id = match &options.image_id {
            Some(id) => id.clone(),
            None => {
                // GPU families fix the CPU, e.g. `t4g` runs on graviton.
                let cpu = families::cpu_of_family(families::family_of(&selection.instance_type))
                    .unwrap_or(target.cpu_type.as_str());
                self.cloud.latest_image(Arch::of_cpu(cpu))?
            }
        };

        let mut spot_price = selection.price;
        let mut attempts = 0;
        let (instance_id, market) = loop {
            attempts += 1;
            let market = choose_market(spot_price, on_demand_price, options.on_demand, &zone);
            let request = LaunchRequest {
                image_id: image_id.clone(),
                instance_type: selection.instance_type.clone(),
                market: market.clone(),
                user_data: user_data.to_string(),
                key_name: options.key_name.clone(),
                iam_profile: options.iam_profile.clone(),
                disk_gib: options.disk_gib,
                client_token: uuid::Uuid::new_v4().to_string(),
            };

            match self.cloud.run_instance(&request) {
                Ok(id) => break (id, market),
                Err(CloudError::Api { code, message })
                    if code == "SpotMaxPriceTooLow" && attempts < LAUNCH_ATTEMPTS =>
                {
                    let Some(price) = extract_last_price(&message) else {
                        return Err(LaunchError::Cloud(CloudError::Api { code, message }));
                    };
                    tracing::warn!(%message, price, "spot bid rejected, retrying");
                    spot_price = price;
                }
                Err(e) => return Err(LaunchError::classify(e, attempts)),
            }
        };

        if let Err(e) = self.cloud.tag(&instance_id, "INSTANCE_ID", &instance_id) {
            tracing::warn!(instance = %instance_id, error = %e, "could not tag instance");
        }
        tracing::info!(instance = %instance_id, ?market, "launched, waiting for it to run");
        self.wait_running(&instance_id)?;

        Ok(Launched {
            instance_id,
            instance_type: selection.instance_type,
            market,
            spot_price,
            on_demand_price,
        })
    }

    /// Poll until the instance reports `running`.
    pub fn wait_running(&self, instance_id: &str) -> core::result::Result<(), LaunchError> {
        let started = Instant::now();
        loop {
            match self.cloud.instance_state(instance_id) {
                Ok(Some(state)) if state == "running" => return Ok(()),
                Ok(state) => tracing::debug!(instance = instance_id, ?state, "not running yet"),
                Err(e) => tracing::debug!(instance = instance_id, error = %e, "state query failed"),
            }
            if started.elapsed() >= self.wait_timeout {
                return Err(LaunchError::NotRunning {
                    id: instance_id.to_string(),
                    secs: self.wait_timeout.as_secs(),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Whether an instance failed its reachability check or has no status.
    pub fn has_failed(&self, instance_id: &str) -> Result<bool> {
        Ok(match self.cloud.reachability(instance_id)?.as_deref() {
            None | Some("impaired" | "failed") => true,
            Some(_) => false,
        })
    }

    /// Terminate every running fleet instance that failed its health check,
    /// returning the ids terminated. `own_id` is never touched.
    pub fn sweep_peers(&self, own_id: Option<&str>) -> Result<Vec<String>> {
        let mut terminated = Vec::new();
        for instance in self.cloud.running_instances(FLEET_TAG_KEY, FLEET_TAG_VALUE)? {
            if own_id == Some(instance.id.as_str()) {
                continue;
            }
            let failed = match self.has_failed(&instance.id) {
                Ok(failed) => failed,
                Err(e) => {
                    tracing::warn!(instance = %instance.id, error = %e, "could not check health");
                    continue;
                }
            };
            if failed {
                tracing::warn!(instance = %instance.id, "peer failed its health check, terminating");
                match self.cloud.terminate(&instance.id) {
                    Ok(()) => terminated.push(instance.id),
                    Err(e) => tracing::warn!(instance = %instance.id, error = %e, "terminate failed"),
                }
            }
        }
        Ok(terminated)
    }

    /// Running fleet instances, longest-running first.
    pub fn list_instances(&self) -> Result<Vec<InstanceRow>> {
        let now = Timestamp::now();
        let mut rows = Vec::new();
        for instance in self.cloud.running_instances(FLEET_TAG_KEY, FLEET_TAG_VALUE)? {
            let healthy = !self.has_failed(&instance.id)?;
            rows.push(InstanceRow {
                uptime: now.duration_since(instance.launch_time),
                healthy,
                instance,
            });
        }
        rows.sort_by(|a, b| a.instance.launch_time.cmp(&b.instance.launch_time));
        Ok(rows)
    }

    /// Terminate by instance id (`i-...`) or public IP. Returns the id, or
    /// `None` when no instance has that IP.
    pub fn terminate(&self, id_or_ip: &str) -> Result<Option<String>> {
        let id = if id_or_ip.starts_with("i-") {
            id_or_ip.to_string()
        } else {
            match self.cloud.instance_by_public_ip(id_or_ip)? {
                Some(id) => id,
                None => return Ok(None),
            }
        };
        self.cloud.terminate(&id)?;
        tracing::info!(instance = %id, "terminating");
        Ok(Some(id))
    }
}

// ── Bootstrap ──

/// Inputs to the user-data script of a new worker.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Arguments passed to `ebfleet build` on the worker.
    pub build_args: Vec<String>,
    /// Shell line that puts `ebfleet` on the PATH, if the image lacks it.
    pub install: Option<String>,
    pub user: String,
}

/// User-data script: prerequisites, hourly monitor, one build pass, then
/// self-termination unless `~/no-terminate` exists.
pub fn bootstrap_script(bootstrap: &Bootstrap) -> String {
    let user = &bootstrap.user;
    let install = bootstrap.install.as_deref().unwrap_or("true");
    let args = bootstrap
        .build_args
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"#!/bin/bash
if command -v dnf >/dev/null; then PM=dnf; else PM=apt-get; export DEBIAN_FRONTEND=noninteractive; fi
$PM update -y
$PM install -y git gcc make python3-pip rclone Lmod cronie cron
mkdir -p /opt/eb/tmp
chown {user} /opt/eb
cat > /home/{user}/ebfleet-bootstrap.sh <<'EOF'
#!/bin/bash
set -u
export PATH=$HOME/.local/bin:$HOME/.cargo/bin:$PATH
{install}
python3 -m pip install --user easybuild
test -d ~/easybuild-easyconfigs || git clone --depth 1 https://github.com/easybuilders/easybuild-easyconfigs
(crontab -l 2>/dev/null; echo "0 * * * * $(command -v ebfleet) monitor >> ~/ebfleet-monitor.log 2>&1") | crontab -
ebfleet build {args} > ~/out.easybuild.$(hostname).txt 2>&1
if [[ ! -f ~/no-terminate ]]; then
  TOKEN=$(curl -sX PUT http://169.254.169.254/latest/api/token -H "X-aws-ec2-metadata-token-ttl-seconds: 60")
  ebfleet terminate "$(curl -sH "X-aws-ec2-metadata-token: $TOKEN" http://169.254.169.254/latest/meta-data/instance-id)"
fi
EOF
chmod +x /home/{user}/ebfleet-bootstrap.sh
chown {user} /home/{user}/ebfleet-bootstrap.sh
su - {user} -c 'nohup ~/ebfleet-bootstrap.sh > ~/ebfleet-bootstrap.log 2>&1 &'
"#
    )
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
