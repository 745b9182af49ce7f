//! `CloudApi` over the `aws` command line.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use jiff::Timestamp;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{
    Arch, CloudApi, CloudError, Cost, CostQuery, FLEET_TAG_KEY, FLEET_TAG_VALUE, Granularity,
    Instance, InstanceTypeInfo, LaunchRequest, Market, Result, SpotPrice,
};
use crate::context::Context;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"An error occurred \((\w+)\)[^:]*:\s*(.*)").expect("aws error regex is valid")
});

const EC2_COMPUTE: &str = "Amazon Elastic Compute Cloud - Compute";

/// The price list API only lives in us-east-1.
const PRICING_REGION: &str = "us-east-1";

/// Price list location names by region code.
const LOCATIONS: &[(&str, &str)] = &[
    ("af-south-1", "Africa (Cape Town)"),
    ("ap-east-1", "Asia Pacific (Hong Kong)"),
    ("ap-south-1", "Asia Pacific (Mumbai)"),
    ("ap-northeast-3", "Asia Pacific (Osaka)"),
    ("ap-northeast-2", "Asia Pacific (Seoul)"),
    ("ap-southeast-1", "Asia Pacific (Singapore)"),
    ("ap-southeast-2", "Asia Pacific (Sydney)"),
    ("ap-northeast-1", "Asia Pacific (Tokyo)"),
    ("ca-central-1", "Canada (Central)"),
    ("eu-central-1", "Europe (Frankfurt)"),
    ("eu-west-1", "Europe (Ireland)"),
    ("eu-west-2", "Europe (London)"),
    ("eu-south-1", "Europe (Milan)"),
    ("eu-west-3", "Europe (Paris)"),
    ("eu-north-1", "Europe (Stockholm)"),
    ("me-south-1", "Middle East (Bahrain)"),
    ("sa-east-1", "South America (Sao Paulo)"),
    ("us-gov-east-1", "AWS GovCloud (US-East)"),
    ("us-gov-west-1", "AWS GovCloud (US-West)"),
    ("us-east-1", "US East (N. Virginia)"),
    ("us-east-2", "US East (Ohio)"),
    ("us-west-1", "US West (N. California)"),
    ("us-west-2", "US West (Oregon)"),
];

pub struct AwsCli {
    ctx: Context,
}

impl AwsCli {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Run `aws <args> --output json` and decode stdout.
    fn call<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self
            .ctx
            .command("aws")
            .args(args)
            .args(["--output", "json"])
            .output()
            .map_err(|source| CloudError::Spawn {
                program: "aws".into(),
                source,
            })?;

        if !output.status.success() {
            return Err(parse_error(&String::from_utf8_lossy(&output.stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::debug!(command = ?args.first(), bytes = stdout.len(), "aws response");
        // Calls with no result print nothing.
        let body = if stdout.trim().is_empty() { "{}" } else { &stdout };
        serde_json::from_str(body).map_err(|e| CloudError::Response(e.to_string()))
    }

    fn describe_instances(&self, filters: &[String]) -> Result<Vec<Instance>> {
        let mut args = vec!["ec2", "describe-instances", "--filters"];
        args.extend(filters.iter().map(String::as_str));
        let response: Reservations = self.call(&args)?;
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(|i| Instance {
                id: i.instance_id,
                instance_type: i.instance_type,
                public_ip: i.public_ip_address,
                launch_time: i.launch_time,
            })
            .collect())
    }
}

/// Code and message from an `aws` error, falling back to the raw text.
fn parse_error(stderr: &str) -> CloudError {
    match ERROR_LINE.captures(stderr) {
        Some(caps) => CloudError::Api {
            code: caps[1].to_string(),
            message: caps[2].trim().to_string(),
        },
        None => CloudError::Response(stderr.trim().to_string()),
    }
}

// ── Response shapes ──

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceTypes {
    #[serde(default)]
    instance_types: Vec<InstanceTypeShape>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceTypeShape {
    instance_type: String,
    v_cpu_info: VCpuInfo,
    memory_info: MemoryInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VCpuInfo {
    default_v_cpus: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MemoryInfo {
    #[serde(rename = "SizeInMiB")]
    size_in_mib: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotPriceHistory {
    #[serde(default)]
    spot_price_history: Vec<SpotPriceShape>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotPriceShape {
    instance_type: String,
    availability_zone: String,
    spot_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PriceList {
    #[serde(default)]
    price_list: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Parameters {
    #[serde(default)]
    parameters: Vec<Parameter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Parameter {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservations {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceShape>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceShape {
    instance_id: String,
    #[serde(default)]
    instance_type: String,
    public_ip_address: Option<String>,
    launch_time: Timestamp,
    state: Option<StateShape>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateShape {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    #[serde(default)]
    instances: Vec<InstanceShape>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStatuses {
    #[serde(default)]
    instance_statuses: Vec<InstanceStatusShape>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStatusShape {
    instance_status: StatusSummary,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusSummary {
    #[serde(default)]
    details: Vec<StatusDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusDetail {
    name: String,
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CostAndUsage {
    #[serde(default)]
    results_by_time: Vec<CostPeriod>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CostPeriod {
    #[serde(default)]
    total: BTreeMap<String, CostMetric>,
    #[serde(default)]
    groups: Vec<CostGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CostGroup {
    keys: Vec<String>,
    metrics: BTreeMap<String, CostMetric>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CostMetric {
    amount: String,
    unit: String,
}

impl CostMetric {
    fn into_cost(self) -> Result<Cost> {
        let amount = self
            .amount
            .parse()
            .map_err(|_| CloudError::Response(format!("bad cost amount {:?}", self.amount)))?;
        Ok(Cost {
            amount,
            unit: self.unit,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    arn: String,
}

/// The on-demand USD price inside one price list entry.
///
/// Entries nest `terms.OnDemand.<offer>.priceDimensions.<dim>.pricePerUnit.USD`
/// under generated keys, so this walks the first child at each level.
fn on_demand_usd(entry: &Value) -> Option<f64> {
    let first = |v: &Value| v.as_object().and_then(|o| o.values().next().cloned());
    let offer = first(entry.get("terms")?.get("OnDemand")?)?;
    let dimension = first(offer.get("priceDimensions")?)?;
    dimension
        .get("pricePerUnit")?
        .get("USD")?
        .as_str()?
        .parse()
        .ok()
}

fn cost_filter(created_by: Option<&str>) -> Value {
    let service = json!({"Dimensions": {"Key": "SERVICE", "Values": [EC2_COMPUTE]}});
    match created_by {
        Some(user) => json!({"And": [service, {"Tags": {"Key": "CreatedBy", "Values": [user]}}]}),
        None => service,
    }
}

fn image_parameter(arch: Arch) -> String {
    format!(
        "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-{}",
        arch.as_str()
    )
}

impl CloudApi for AwsCli {
    fn instance_types(&self, families: &[&str]) -> Result<Vec<InstanceTypeInfo>> {
        let patterns: Vec<String> = families.iter().map(|f| format!("{f}.*")).collect();
        let filter = format!("Name=instance-type,Values={}", patterns.join(","));
        let response: InstanceTypes =
            self.call(&["ec2", "describe-instance-types", "--filters", &filter])?;
        Ok(response
            .instance_types
            .into_iter()
            .map(|t| InstanceTypeInfo {
                name: t.instance_type,
                vcpus: t.v_cpu_info.default_v_cpus,
                memory_mib: t.memory_info.size_in_mib,
            })
            .collect())
    }

    fn spot_prices(&self, instance_types: &[String], since: Timestamp) -> Result<Vec<SpotPrice>> {
        let since = since.to_string();
        let mut args = vec![
            "ec2",
            "describe-spot-price-history",
            "--product-descriptions",
            "Linux/UNIX",
            "--start-time",
            &since,
            "--instance-types",
        ];
        args.extend(instance_types.iter().map(String::as_str));
        let response: SpotPriceHistory = self.call(&args)?;

        let mut prices = Vec::new();
        for entry in response.spot_price_history {
            match entry.spot_price.parse() {
                Ok(price) => prices.push(SpotPrice {
                    instance_type: entry.instance_type,
                    availability_zone: entry.availability_zone,
                    price,
                }),
                Err(_) => tracing::debug!(price = %entry.spot_price, "unparseable spot price"),
            }
        }
        Ok(prices)
    }

    fn on_demand_price(&self, instance_type: &str) -> Result<Option<f64>> {
        let Some((_, location)) = LOCATIONS.iter().find(|(r, _)| *r == self.ctx.region) else {
            return Ok(None);
        };
        let term = |field: &str, value: &str| format!("Type=TERM_MATCH,Field={field},Value={value}");
        let filters = [
            term("instanceType", instance_type),
            term("location", location),
            term("preInstalledSw", "NA"),
            term("operatingSystem", "Linux"),
            term("tenancy", "Shared"),
            term("capacitystatus", "Used"),
        ];
        let mut args = vec![
            "pricing",
            "get-products",
            "--region",
            PRICING_REGION,
            "--service-code",
            "AmazonEC2",
            "--max-results",
            "1",
            "--filters",
        ];
        args.extend(filters.iter().map(String::as_str));
        let response: PriceList = self.call(&args)?;

        let Some(entry) = response.price_list.first() else {
            return Ok(None);
        };
        let entry: Value =
            serde_json::from_str(entry).map_err(|e| CloudError::Response(e.to_string()))?;
        Ok(on_demand_usd(&entry))
    }

    fn latest_image(&self, arch: Arch) -> Result<String> {
        let name = image_parameter(arch);
        let response: Parameters = self.call(&["ssm", "get-parameters", "--names", &name])?;
        response
            .parameters
            .into_iter()
            .next()
            .map(|p| p.value)
            .ok_or_else(|| CloudError::Response(format!("no image for {name}")))
    }

    fn run_instance(&self, request: &LaunchRequest) -> Result<String> {
        let tags = format!(
            "ResourceType=instance,Tags=[{{Key={FLEET_TAG_KEY},Value={FLEET_TAG_VALUE}}}]"
        );
        let mut args: Vec<String> = [
            "ec2",
            "run-instances",
            "--count",
            "1",
            "--image-id",
            request.image_id.as_str(),
            "--instance-type",
            request.instance_type.as_str(),
            "--client-token",
            request.client_token.as_str(),
            "--user-data",
            request.user_data.as_str(),
            "--tag-specifications",
            tags.as_str(),
        ]
        .map(String::from)
        .to_vec();

        if let Some(key) = &request.key_name {
            args.extend(["--key-name".into(), key.clone()]);
        }
        if let Some(profile) = &request.iam_profile {
            args.extend(["--iam-instance-profile".into(), format!("Name={profile}")]);
        }
        if request.disk_gib > 0 {
            let mapping = json!([{
                "DeviceName": "/dev/sdm",
                "Ebs": {
                    "VolumeSize": request.disk_gib,
                    "DeleteOnTermination": true,
                    "VolumeType": "gp3",
                    "Iops": 3000,
                    "Throughput": 750,
                },
            }]);
            args.extend(["--block-device-mappings".into(), mapping.to_string()]);
        }
        if let Market::Spot {
            max_price,
            availability_zone,
        } = &request.market
        {
            let options = json!({
                "MarketType": "spot",
                "SpotOptions": {
                    "MaxPrice": format!("{max_price:.4}"),
                    "SpotInstanceType": "one-time",
                    "InstanceInterruptionBehavior": "terminate",
                },
            });
            args.extend([
                "--instance-market-options".into(),
                options.to_string(),
                "--placement".into(),
                format!("AvailabilityZone={availability_zone}"),
            ]);
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let response: RunInstances = self.call(&args)?;
        response
            .instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| CloudError::Response("run-instances returned no instance".into()))
    }

    fn tag(&self, instance_id: &str, key: &str, value: &str) -> Result<()> {
        let tag = format!("Key={key},Value={value}");
        let _: Value = self.call(&["ec2", "create-tags", "--resources", instance_id, "--tags", &tag])?;
        Ok(())
    }

    fn running_instances(&self, key: &str, value: &str) -> Result<Vec<Instance>> {
        self.describe_instances(&[
            format!("Name=tag:{key},Values={value}"),
            "Name=instance-state-name,Values=running".into(),
        ])
    }

    fn instance_state(&self, instance_id: &str) -> Result<Option<String>> {
        let response: Reservations =
            self.call(&["ec2", "describe-instances", "--instance-ids", instance_id])?;
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .find(|i| i.instance_id == instance_id)
            .and_then(|i| i.state)
            .map(|s| s.name))
    }

    fn reachability(&self, instance_id: &str) -> Result<Option<String>> {
        let response: InstanceStatuses =
            self.call(&["ec2", "describe-instance-status", "--instance-ids", instance_id])?;
        Ok(response.instance_statuses.into_iter().next().and_then(|s| {
            s.instance_status
                .details
                .into_iter()
                .find(|d| d.name == "reachability")
                .map(|d| d.status)
        }))
    }

    fn instance_by_public_ip(&self, ip: &str) -> Result<Option<String>> {
        Ok(self
            .describe_instances(&[format!(
                "Name=network-interface.addresses.association.public-ip,Values={ip}"
            )])?
            .into_iter()
            .next()
            .map(|i| i.id))
    }

    fn terminate(&self, instance_id: &str) -> Result<()> {
        let _: Value = self.call(&["ec2", "terminate-instances", "--instance-ids", instance_id])?;
        Ok(())
    }

    fn cost(&self, query: &CostQuery) -> Result<Cost> {
        let response: CostAndUsage = self.cost_and_usage(query, false)?;
        response
            .results_by_time
            .into_iter()
            .next()
            .and_then(|mut p| p.total.remove("UnblendedCost"))
            .ok_or_else(|| CloudError::Response("no cost total".into()))?
            .into_cost()
    }

    fn cost_by_instance_type(&self, query: &CostQuery) -> Result<Vec<(String, Cost)>> {
        let response: CostAndUsage = self.cost_and_usage(query, true)?;
        let mut costs = Vec::new();
        for period in response.results_by_time.into_iter().take(1) {
            for mut group in period.groups {
                let (Some(key), Some(metric)) = (group.keys.pop(), group.metrics.remove("UnblendedCost"))
                else {
                    continue;
                };
                costs.push((key, metric.into_cost()?));
            }
        }
        Ok(costs)
    }

    fn caller_arn(&self) -> Result<String> {
        let identity: CallerIdentity = self.call(&["sts", "get-caller-identity"])?;
        Ok(identity.arn)
    }
}

impl AwsCli {
    fn cost_and_usage(&self, query: &CostQuery, by_instance_type: bool) -> Result<CostAndUsage> {
        let period = format!("Start={},End={}", query.start, query.end);
        let granularity = match query.granularity {
            Granularity::Daily => "DAILY",
            Granularity::Monthly => "MONTHLY",
        };
        let filter = cost_filter(query.created_by.as_deref()).to_string();
        let mut args = vec![
            "ce",
            "get-cost-and-usage",
            "--time-period",
            &period,
            "--granularity",
            granularity,
            "--metrics",
            "UnblendedCost",
            "--filter",
            &filter,
        ];
        if by_instance_type {
            args.extend(["--group-by", "Type=DIMENSION,Key=INSTANCE_TYPE"]);
        }
        self.call(&args)
    }
}
