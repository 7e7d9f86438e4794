//! Domain types shared by every FleetGrid component.
//!
//! These types describe the fleet as the control plane sees it: which
//! app versions run (or should run) on which host, what each host has to
//! offer, what each app needs, and what hosts report when they check in.
//! All types are serializable so they can be persisted or logged as JSON.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a host (cloud instance) in the fleet.
pub type HostId = String;

/// Name of a configured application.
pub type AppName = String;

/// Number of instances of one app version on one host.
pub type DeploymentCount = u32;

// ── Versions ──────────────────────────────────────────────────────

/// An application version.
///
/// Versions are opaque strings that still need a total order: the planner
/// always wants "the newest" version. Dot-separated components compare
/// numerically when both sides are unsigned integers and lexicographically
/// otherwise, so `"10" > "9"` and `"1.10" > "1.9"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut lhs = self.0.split('.');
        let mut rhs = other.0.split('.');
        loop {
            match (lhs.next(), rhs.next()) {
                (None, None) => break,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
                        (Ok(a), Ok(b)) => a.cmp(&b),
                        _ => a.cmp(b),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
        // "01" and "1" are numerically equal but distinct versions.
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for Version {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

// ── Layout ────────────────────────────────────────────────────────

/// How many instances of a single app version run (or should run) on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsVersion {
    pub version: Version,
    pub deployment_count: DeploymentCount,
}

impl AppsVersion {
    pub fn new(version: impl Into<Version>, deployment_count: DeploymentCount) -> Self {
        Self {
            version: version.into(),
            deployment_count,
        }
    }
}

/// One host's entry in a layout snapshot.
///
/// Keyed by app name, so a snapshot can never hold two versions of the
/// same app on the same host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloudLayoutElement {
    pub host_id: HostId,
    pub ip_address: String,
    pub habitat_version: String,
    pub apps: BTreeMap<AppName, AppsVersion>,
}

impl CloudLayoutElement {
    pub fn new(host_id: impl Into<HostId>) -> Self {
        Self {
            host_id: host_id.into(),
            ..Default::default()
        }
    }

    pub fn has_app(&self, app: &str) -> bool {
        self.apps.contains_key(app)
    }
}

/// A full layout snapshot: host id → element. Ordered for deterministic iteration.
pub type CloudLayout = BTreeMap<HostId, CloudLayoutElement>;

// ── Resources ─────────────────────────────────────────────────────

/// Capacity and planned usage of a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceResources {
    pub total_cpu: u64,
    pub total_memory: u64,
    pub total_network: u64,
    pub used_cpu: u64,
    pub used_memory: u64,
    pub used_network: u64,
}

impl InstanceResources {
    pub fn with_totals(cpu: u64, memory: u64, network: u64) -> Self {
        Self {
            total_cpu: cpu,
            total_memory: memory,
            total_network: network,
            ..Default::default()
        }
    }

    pub fn free_cpu(&self) -> u64 {
        self.total_cpu.saturating_sub(self.used_cpu)
    }

    pub fn free_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.used_memory)
    }

    pub fn free_network(&self) -> u64 {
        self.total_network.saturating_sub(self.used_network)
    }

    /// Headroom summed across all three dimensions.
    pub fn headroom(&self) -> u64 {
        self.free_cpu()
            .saturating_add(self.free_memory())
            .saturating_add(self.free_network())
    }

    /// Whether one more instance with `needs` fits without overcommitting.
    pub fn fits(&self, needs: &AppNeeds) -> bool {
        self.free_cpu() >= needs.cpu
            && self.free_memory() >= needs.memory
            && self.free_network() >= needs.network
    }

    /// Add `count` instances worth of `needs` to the used counters.
    pub fn consume(&mut self, needs: &AppNeeds, count: u32) {
        let scaled = needs.scaled(count);
        self.used_cpu = self.used_cpu.saturating_add(scaled.cpu);
        self.used_memory = self.used_memory.saturating_add(scaled.memory);
        self.used_network = self.used_network.saturating_add(scaled.network);
    }

    /// Drop all usage, keeping the totals.
    pub fn cleared(&self) -> Self {
        Self::with_totals(self.total_cpu, self.total_memory, self.total_network)
    }
}

/// Per-instance resource needs of an app version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppNeeds {
    pub cpu: u64,
    pub memory: u64,
    pub network: u64,
}

impl AppNeeds {
    pub const fn new(cpu: u64, memory: u64, network: u64) -> Self {
        Self {
            cpu,
            memory,
            network,
        }
    }

    pub fn total(&self) -> u64 {
        self.cpu
            .saturating_add(self.memory)
            .saturating_add(self.network)
    }

    pub fn scaled(&self, count: u32) -> Self {
        let n = u64::from(count);
        Self {
            cpu: self.cpu.saturating_mul(n),
            memory: self.memory.saturating_mul(n),
            network: self.network.saturating_mul(n),
        }
    }

    /// Component-wise sum.
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            network: self.network.saturating_add(other.network),
        }
    }

    /// Component-wise maximum.
    pub fn max(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            network: self.network.max(other.network),
        }
    }

    /// True when every dimension is non-zero.
    pub fn is_complete(&self) -> bool {
        self.cpu > 0 && self.memory > 0 && self.network > 0
    }
}

// ── Configuration ─────────────────────────────────────────────────

/// Kind of workload an app runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    #[default]
    Http,
    Worker,
}

/// Shell commands used to install and remove an app on a host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub install_commands: Vec<String>,
    #[serde(default)]
    pub remove_commands: Vec<String>,
}

/// Container settings for apps shipped as docker images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub repository: String,
    pub reference: String,
}

/// Versioned descriptor of an application.
///
/// A record is immutable once stored; a new version is a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfiguration {
    pub name: AppName,
    #[serde(rename = "type", default)]
    pub app_type: AppType,
    pub version: Version,
    #[serde(default)]
    pub min_deployment_count: DeploymentCount,
    pub target_deployment_count: DeploymentCount,
    /// Upper bound for the planner. `0` means unbounded.
    #[serde(default)]
    pub max_deployment_count: DeploymentCount,
    #[serde(default)]
    pub raw_config: RawConfig,
    #[serde(default)]
    pub docker_config: Option<DockerConfig>,
    #[serde(default)]
    pub port_mappings: HashMap<u16, u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Flat per-instance needs used to seed the needs store.
    #[serde(default)]
    pub needs: AppNeeds,
}

impl AppConfiguration {
    /// `(min, target, max)` collapsed into the count the planner should aim for.
    pub fn effective_target(&self) -> DeploymentCount {
        let mut target = self.target_deployment_count.max(self.min_deployment_count);
        if self.max_deployment_count > 0 {
            target = target.min(self.max_deployment_count);
        }
        target
    }

    /// Key under which this record is persisted.
    pub fn table_key(&self) -> String {
        config_key(&self.name, &self.version)
    }
}

pub(crate) fn config_key(name: &str, version: &Version) -> String {
    format!("{name}:{version}")
}

/// What a host receives when it polls for work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfiguration {
    pub deployment_count: DeploymentCount,
    pub app_configuration: AppConfiguration,
}

// ── Host reports ──────────────────────────────────────────────────

/// Status of one app instance as reported by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Init,
    Running,
    Deploying,
    Dead,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Deploying => "deploying",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// One app instance as reported by its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(rename = "type", default)]
    pub app_type: AppType,
    pub name: AppName,
    pub version: Version,
    pub status: AppStatus,
    pub id: String,
}

/// Load figures a host sends along with its checkin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HostStats {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_usage: f64,
}

/// A host checkin report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_id: HostId,
    pub ip_addr: String,
    #[serde(default)]
    pub os_info: String,
    /// Version of the agent running on the host.
    #[serde(default)]
    pub habitat_version: String,
    #[serde(default)]
    pub apps: Vec<AppInfo>,
    #[serde(default)]
    pub stats: HostStats,
}

/// Current Unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_orders_numerically() {
        assert!(Version::from("10") > Version::from("9"));
        assert!(Version::from("1.10") > Version::from("1.9"));
        assert!(Version::from("1.2") > Version::from("1"));
        assert!(Version::from("2") > Version::from("1.99"));
    }

    #[test]
    fn version_falls_back_to_lexicographic() {
        assert!(Version::from("1.0-rc2") > Version::from("1.0-rc1"));
        assert!(Version::from("beta") > Version::from("alpha"));
    }

    #[test]
    fn version_order_agrees_with_equality() {
        let a = Version::from("01");
        let b = Version::from("1");
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn version_serializes_as_plain_string() {
        let json = serde_json::to_string(&Version::from("1.2")).unwrap();
        assert_eq!(json, "\"1.2\"");
    }

    #[test]
    fn headroom_saturates() {
        let mut res = InstanceResources::with_totals(10, 10, 10);
        res.consume(&AppNeeds::new(20, 5, 0), 1);
        assert_eq!(res.free_cpu(), 0);
        assert_eq!(res.headroom(), 15);
        assert!(!res.fits(&AppNeeds::new(1, 1, 1)));
    }

    #[test]
    fn effective_target_clamps() {
        let mut conf = AppConfiguration {
            name: "web".into(),
            app_type: AppType::Http,
            version: "1".into(),
            min_deployment_count: 2,
            target_deployment_count: 1,
            max_deployment_count: 0,
            raw_config: RawConfig::default(),
            docker_config: None,
            port_mappings: HashMap::new(),
            env: HashMap::new(),
            needs: AppNeeds::default(),
        };
        assert_eq!(conf.effective_target(), 2);

        conf.target_deployment_count = 10;
        conf.max_deployment_count = 4;
        assert_eq!(conf.effective_target(), 4);
    }

    #[test]
    fn app_status_wire_names() {
        let json = serde_json::to_string(&AppStatus::Deploying).unwrap();
        assert_eq!(json, "\"deploying\"");
        let parsed: AppStatus = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(parsed, AppStatus::Dead);
    }
}
