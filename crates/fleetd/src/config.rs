//! fleetd.toml settings.

use std::path::Path;
use std::time::Duration;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use fleetgrid_placement::PlannerPolicy;
use fleetgrid_state::{AppConfiguration, AppNeeds, Version};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub planner: PlannerPolicy,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub apps: Vec<AppConfiguration>,
    #[serde(default)]
    pub forecasts: Vec<ForecastConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub plan_interval_secs: u64,
    pub host_check_interval_secs: u64,
    pub host_checkin_timeout_secs: u64,
    /// How long a host spawned for capacity may take to check in.
    pub spawn_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            plan_interval_secs: 60,
            host_check_interval_secs: 15,
            host_checkin_timeout_secs: 300,
            spawn_timeout_secs: 600,
        }
    }
}

impl SchedulerConfig {
    pub fn plan_interval(&self) -> Duration {
        Duration::from_secs(self.plan_interval_secs)
    }

    pub fn host_check_interval(&self) -> Duration {
        Duration::from_secs(self.host_check_interval_secs)
    }

    pub fn host_checkin_timeout(&self) -> Duration {
        Duration::from_secs(self.host_checkin_timeout_secs)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Crash records kept per app version.
    pub max_crash_details: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_crash_details: 64,
        }
    }
}

/// A statically provisioned host and the capacity of its instance type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: String,
    pub ip: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    pub cpu: u64,
    pub memory: u64,
    pub network: u64,
}

fn default_instance_type() -> String {
    "standard".to_string()
}

/// Expected needs of an app version during one 15 minute slot of the week.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub app: String,
    pub version: Version,
    pub day: Weekday,
    /// Minute of the day (UTC) the slot starts at.
    pub minute: u32,
    pub cpu: u64,
    pub memory: u64,
    pub network: u64,
}

impl ForecastConfig {
    pub fn needs(&self) -> AppNeeds {
        AppNeeds::new(self.cpu, self.memory, self.network)
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.plan_interval_secs == 0 || self.scheduler.host_check_interval_secs == 0 {
            anyhow::bail!("scheduler intervals must be at least one second");
        }
        if !(0.0..1.0).contains(&self.planner.watermark) {
            anyhow::bail!("planner watermark must be in [0, 1), got {}", self.planner.watermark);
        }
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.id.as_str()) {
                anyhow::bail!("host '{}' is declared twice", host.id);
            }
        }
        for app in &self.apps {
            if app.max_deployment_count != 0 && app.min_deployment_count > app.max_deployment_count
            {
                anyhow::bail!(
                    "app '{}' version {}: min_deployment_count exceeds max_deployment_count",
                    app.name,
                    app.version
                );
            }
        }
        for forecast in &self.forecasts {
            if forecast.minute >= 24 * 60 {
                anyhow::bail!(
                    "forecast for '{}' version {}: minute {} is past the end of the day",
                    forecast.app,
                    forecast.version,
                    forecast.minute
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[scheduler]
plan_interval_secs = 30

[planner]
try_to_remove_hosts = false

[[hosts]]
id = "host1"
ip = "10.0.0.1"
cpu = 400
memory = 1600
network = 100

[[hosts]]
id = "host2"
ip = "10.0.0.2"
instance_type = "large"
cpu = 800
memory = 3200
network = 200

[[apps]]
name = "httpApp_1"
type = "http"
version = "1"
target_deployment_count = 2

[apps.raw_config]
install_commands = ["docker pull registry/http-app:1"]
remove_commands = ["docker rm -f http-app"]

[apps.needs]
cpu = 50
memory = 256
network = 10

[[forecasts]]
app = "httpApp_1"
version = "1"
day = "Mon"
minute = 540
cpu = 200
memory = 1024
network = 40
"#;

    #[test]
    fn parses_sample() {
        let config = DaemonConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.scheduler.plan_interval(), Duration::from_secs(30));
        assert_eq!(config.scheduler.host_check_interval_secs, 15);
        assert_eq!(config.scheduler.host_checkin_timeout(), Duration::from_secs(300));
        assert!(!config.planner.try_to_remove_hosts);
        assert_eq!(config.planner.watermark, 0.2);
        assert_eq!(config.tracker.max_crash_details, 64);

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].instance_type, "standard");
        assert_eq!(config.hosts[1].instance_type, "large");

        let app = &config.apps[0];
        assert_eq!(app.target_deployment_count, 2);
        assert_eq!(app.raw_config.install_commands.len(), 1);
        assert_eq!(app.needs.memory, 256);

        let forecast = &config.forecasts[0];
        assert_eq!(forecast.day, Weekday::Mon);
        assert_eq!(forecast.needs(), AppNeeds::new(200, 1024, 40));
        assert_eq!(config.scheduler.spawn_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.scheduler.plan_interval_secs, 60);
        assert!(config.planner.try_to_remove_hosts);
        assert!(config.hosts.is_empty());
        assert!(config.apps.is_empty());
        assert!(config.forecasts.is_empty());
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let toml = r#"
[[hosts]]
id = "h1"
ip = "10.0.0.1"
cpu = 1
memory = 1
network = 1

[[hosts]]
id = "h1"
ip = "10.0.0.2"
cpu = 1
memory = 1
network = 1
"#;
        let err = DaemonConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn rejects_bad_watermark_and_intervals() {
        assert!(DaemonConfig::parse("[planner]\nwatermark = 1.5").is_err());
        assert!(DaemonConfig::parse("[scheduler]\nplan_interval_secs = 0").is_err());
    }

    #[test]
    fn rejects_forecast_past_midnight() {
        let toml = r#"
[[forecasts]]
app = "web"
version = "1"
day = "Sun"
minute = 1440
cpu = 1
memory = 1
network = 1
"#;
        let err = DaemonConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("past the end of the day"));
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.apps[0].name, "httpApp_1");

        assert!(DaemonConfig::from_file(Path::new("/nonexistent/fleetd.toml")).is_err());
    }
}
