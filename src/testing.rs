//! In-memory stand-ins for the external tools, shared by unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use jiff::Timestamp;

use crate::catalog::{self, CatalogError, RawRecipe, RawToolchain, RecipeParser};
use crate::fleet::{
    self, Arch, CloudApi, CloudError, Cost, CostQuery, Instance, InstanceTypeInfo, LaunchRequest,
    SpotPrice,
};
use crate::model::MissingModules;
use crate::notify::Notifier;
use crate::toolchain::{self, BuildMode, BuildOutcome, Toolchain, ToolchainError};
use crate::transfer::{self, TransferStats, TransferTool};

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── Recipe parser ──

/// Parser returning canned recipes keyed by filename.
#[derive(Default)]
pub struct FakeParser {
    pub recipes: HashMap<String, RawRecipe>,
}

impl FakeParser {
    pub fn add(&mut self, file: &str, name: &str, version: &str, tc: (&str, &str)) {
        self.recipes.insert(
            file.to_string(),
            RawRecipe {
                name: name.into(),
                version: version.into(),
                toolchain: Some(RawToolchain {
                    name: tc.0.into(),
                    version: tc.1.into(),
                }),
                moduleclass: Some("lib".into()),
                ..RawRecipe::default()
            },
        );
    }
}

impl RecipeParser for FakeParser {
    fn parse(&self, path: &Path) -> catalog::Result<RawRecipe> {
        self.recipes
            .get(&file_name(path))
            .cloned()
            .ok_or_else(|| CatalogError::Parse {
                path: path.to_path_buf(),
                message: "unknown recipe".into(),
            })
    }
}

// ── Toolchain ──

/// Toolchain with scripted missing-module reports and failures.
///
/// A successful build clears the missing modules of that recipe.
#[derive(Default)]
pub struct FakeToolchain {
    missing: RefCell<HashMap<String, MissingModules>>,
    failing_queries: RefCell<HashSet<String>>,
    failing_builds: RefCell<HashSet<String>>,
    builds: RefCell<Vec<(String, BuildMode)>>,
    queries: Cell<usize>,
    pub log: Option<PathBuf>,
}

impl FakeToolchain {
    /// A toolchain whose last log is `log`.
    pub fn with_log(log: PathBuf) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn set_missing(&self, recipe: &str, missing: MissingModules) {
        self.missing.borrow_mut().insert(recipe.to_string(), missing);
    }

    pub fn fail_query(&self, recipe: &str) {
        self.failing_queries.borrow_mut().insert(recipe.to_string());
    }

    pub fn fail_build(&self, recipe: &str) {
        self.failing_builds.borrow_mut().insert(recipe.to_string());
    }

    pub fn query_count(&self) -> usize {
        self.queries.get()
    }

    pub fn builds(&self) -> Vec<(String, BuildMode)> {
        self.builds.borrow().clone()
    }
}

impl Toolchain for FakeToolchain {
    fn build(&self, recipe: &Path, mode: BuildMode) -> toolchain::Result<BuildOutcome> {
        let name = file_name(recipe);
        self.builds.borrow_mut().push((name.clone(), mode));
        let failed = self.failing_builds.borrow().contains(&name);
        if !failed {
            self.missing.borrow_mut().remove(&name);
        }
        Ok(BuildOutcome {
            returncode: if failed { 1 } else { 0 },
            elapsed: Duration::from_secs(2),
        })
    }

    fn missing_modules(&self, recipe: &Path) -> toolchain::Result<MissingModules> {
        self.queries.set(self.queries.get() + 1);
        let name = file_name(recipe);
        if self.failing_queries.borrow().contains(&name) {
            return Err(ToolchainError::Query {
                recipe: name,
                message: "robot path not set".into(),
            });
        }
        Ok(self.missing.borrow().get(&name).cloned().unwrap_or_default())
    }

    fn last_log(&self) -> Option<PathBuf> {
        self.log.clone()
    }
}

// ── Transfer tool ──

/// Transfer tool that records calls and returns fixed stats.
#[derive(Default)]
pub struct FakeTransfer {
    stats: TransferStats,
    calls: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeTransfer {
    pub fn with_stats(stats: TransferStats) -> Self {
        Self {
            stats,
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl TransferTool for FakeTransfer {
    fn copy(&self, source: &str, dest: &str, args: &[String]) -> transfer::Result<TransferStats> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((source.to_string(), dest.to_string(), args.to_vec()));
        }
        Ok(self.stats.clone())
    }
}

// ── Cloud ──

/// Scripted cloud: canned types, prices and instances; records launches,
/// tags, terminations and cost queries.
#[derive(Default)]
pub struct FakeCloud {
    types: RefCell<Vec<InstanceTypeInfo>>,
    spots: RefCell<Vec<SpotPrice>>,
    on_demand: Cell<Option<f64>>,
    launch_errors: RefCell<VecDeque<CloudError>>,
    launch_state: RefCell<Option<String>>,
    instances: RefCell<Vec<(Instance, Option<String>)>>,
    requests: RefCell<Vec<LaunchRequest>>,
    tags: RefCell<Vec<(String, String, String)>>,
    terminated: RefCell<Vec<String>>,
    caller: RefCell<String>,
    cost: Cell<f64>,
    daily: RefCell<Vec<(String, Cost)>>,
    cost_queries: RefCell<Vec<CostQuery>>,
}

impl FakeCloud {
    pub fn add_type(&self, name: &str, vcpus: u32, memory_mib: u64) {
        self.types.borrow_mut().push(InstanceTypeInfo {
            name: name.into(),
            vcpus,
            memory_mib,
        });
    }

    pub fn add_spot(&self, instance_type: &str, zone: &str, price: f64) {
        self.spots.borrow_mut().push(SpotPrice {
            instance_type: instance_type.into(),
            availability_zone: zone.into(),
            price,
        });
    }

    pub fn set_on_demand(&self, price: f64) {
        self.on_demand.set(Some(price));
    }

    /// Queue a `SpotMaxPriceTooLow` rejection for the next launch.
    pub fn reject_spot(&self, message: &str) {
        self.fail_launch("SpotMaxPriceTooLow", message);
    }

    pub fn fail_launch(&self, code: &str, message: &str) {
        self.launch_errors.borrow_mut().push_back(CloudError::Api {
            code: code.into(),
            message: message.into(),
        });
    }

    /// State reported for launched instances, `running` by default.
    pub fn set_launch_state(&self, state: &str) {
        *self.launch_state.borrow_mut() = Some(state.into());
    }

    pub fn add_instance(&self, id: &str, ip: &str, reachability: Option<&str>) {
        let count = i64::try_from(self.instances.borrow().len()).unwrap_or(0);
        self.instances.borrow_mut().push((
            Instance {
                id: id.into(),
                instance_type: "c7g.large".into(),
                public_ip: Some(ip.into()),
                launch_time: Timestamp::from_second(1_714_557_600 + count * 60).unwrap(),
            },
            reachability.map(str::to_string),
        ));
    }

    pub fn set_caller(&self, arn: &str) {
        *self.caller.borrow_mut() = arn.into();
    }

    pub fn set_cost(&self, amount: f64) {
        self.cost.set(amount);
    }

    pub fn add_daily_cost(&self, instance_type: &str, amount: f64) {
        self.daily.borrow_mut().push((
            instance_type.into(),
            Cost {
                amount,
                unit: "USD".into(),
            },
        ));
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.borrow().clone()
    }

    pub fn tags(&self) -> Vec<(String, String, String)> {
        self.tags.borrow().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.borrow().clone()
    }

    pub fn cost_queries(&self) -> Vec<CostQuery> {
        self.cost_queries.borrow().clone()
    }
}

impl CloudApi for FakeCloud {
    fn instance_types(&self, _families: &[&str]) -> fleet::Result<Vec<InstanceTypeInfo>> {
        Ok(self.types.borrow().clone())
    }

    fn spot_prices(&self, types: &[String], _since: Timestamp) -> fleet::Result<Vec<SpotPrice>> {
        Ok(self
            .spots
            .borrow()
            .iter()
            .filter(|s| types.contains(&s.instance_type))
            .cloned()
            .collect())
    }

    fn on_demand_price(&self, _instance_type: &str) -> fleet::Result<Option<f64>> {
        Ok(self.on_demand.get())
    }

    fn latest_image(&self, arch: Arch) -> fleet::Result<String> {
        Ok(format!("ami-{}", arch.as_str()))
    }

    fn run_instance(&self, request: &LaunchRequest) -> fleet::Result<String> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(error) = self.launch_errors.borrow_mut().pop_front() {
            return Err(error);
        }
        Ok(format!("i-{:04}", self.requests.borrow().len()))
    }

    fn tag(&self, instance_id: &str, key: &str, value: &str) -> fleet::Result<()> {
        self.tags
            .borrow_mut()
            .push((instance_id.into(), key.into(), value.into()));
        Ok(())
    }

    fn running_instances(&self, _key: &str, _value: &str) -> fleet::Result<Vec<Instance>> {
        Ok(self
            .instances
            .borrow()
            .iter()
            .map(|(i, _)| i.clone())
            .filter(|i| !self.terminated.borrow().contains(&i.id))
            .collect())
    }

    fn instance_state(&self, _instance_id: &str) -> fleet::Result<Option<String>> {
        Ok(Some(
            self.launch_state
                .borrow()
                .clone()
                .unwrap_or_else(|| "running".into()),
        ))
    }

    fn reachability(&self, instance_id: &str) -> fleet::Result<Option<String>> {
        Ok(self
            .instances
            .borrow()
            .iter()
            .find(|(i, _)| i.id == instance_id)
            .and_then(|(_, status)| status.clone()))
    }

    fn instance_by_public_ip(&self, ip: &str) -> fleet::Result<Option<String>> {
        Ok(self
            .instances
            .borrow()
            .iter()
            .find(|(i, _)| i.public_ip.as_deref() == Some(ip))
            .map(|(i, _)| i.id.clone()))
    }

    fn terminate(&self, instance_id: &str) -> fleet::Result<()> {
        self.terminated.borrow_mut().push(instance_id.into());
        Ok(())
    }

    fn cost(&self, query: &CostQuery) -> fleet::Result<Cost> {
        self.cost_queries.borrow_mut().push(query.clone());
        Ok(Cost {
            amount: self.cost.get(),
            unit: "USD".into(),
        })
    }

    fn cost_by_instance_type(&self, query: &CostQuery) -> fleet::Result<Vec<(String, Cost)>> {
        self.cost_queries.borrow_mut().push(query.clone());
        Ok(self.daily.borrow().clone())
    }

    fn caller_arn(&self) -> fleet::Result<String> {
        Ok(self.caller.borrow().clone())
    }
}

// ── Notifier ──

#[derive(Default)]
pub struct RecordingNotifier {
    sent: RefCell<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, subject: &str, body: &str) {
        self.sent.borrow_mut().push((subject.into(), body.into()));
    }
}
