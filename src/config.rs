//! Scheduler configuration.
//!
//! Values are merged from several sources with figment, lowest precedence
//! first: built-in defaults, `aicpu-sched.toml`, `aicpu-sched.yaml`,
//! `AICPU_`-prefixed environment variables, and finally the raw
//! `PROCMGR_AICPU_CPUSET` switch used by the process manager.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use figment::{Figment, providers::{Env, Format, Toml, Yaml}};
use tracing::debug;

use crate::constants::{affinity, coalescer, topology};
use crate::error::{Result, SchedError};
use crate::reliability::tracing::LogConfig;
use crate::types::{AffinityMode, DeployContext, RunMode, SchedMode};

/// Serde helper for Duration serialization/deserialization as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for Duration serialization/deserialization as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Default value functions for serde defaults
fn default_device_ids() -> Vec<u32> { vec![0] }
fn default_sched_mode() -> SchedMode { SchedMode::Interrupt }
fn default_run_mode() -> RunMode { RunMode::Process }
fn default_deploy() -> DeployContext { DeployContext::Device }
fn default_affinity() -> AffinityMode { AffinityMode::SelfManaged }
fn default_event_wait_timeout() -> Duration { Duration::from_millis(3000) }
fn default_call_mode_max_timeouts() -> u32 { 40 }
fn default_bind_poll_interval() -> Duration { Duration::from_millis(10) }
fn default_bind_timeout() -> Duration { Duration::from_secs(120) }
fn default_ts_send_retries() -> u32 { coalescer::TS_SEND_RETRIES }
fn default_ts_send_retry_interval() -> Duration {
    Duration::from_millis(coalescer::TS_SEND_RETRY_INTERVAL_MS)
}
fn default_log_level() -> String { "info".to_string() }

/// Scheduler configuration loaded from multiple sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Devices served by this scheduler instance
    #[serde(default = "default_device_ids")]
    pub device_ids: Vec<u32>,

    /// Host process the scheduler is bound to
    #[serde(default)]
    pub host_pid: u32,

    /// Virtual function id, 0 when not split
    #[serde(default)]
    pub vf_id: u32,

    /// Event delivery backend
    #[serde(default = "default_sched_mode")]
    pub sched_mode: SchedMode,

    #[serde(default = "default_run_mode")]
    pub run_mode: RunMode,

    #[serde(default = "default_deploy")]
    pub deploy: DeployContext,

    /// Who pins worker threads
    #[serde(default = "default_affinity")]
    pub affinity: AffinityMode,

    /// cgroup task file receiving worker tids before pinning
    #[serde(default)]
    pub cgroup_tasks_file: Option<PathBuf>,

    /// Scheduler group id on each device
    #[serde(default)]
    pub group_id: u32,

    /// Bounded wait of the interrupt transport
    #[serde(with = "duration_millis", default = "default_event_wait_timeout")]
    pub event_wait_timeout: Duration,

    /// Consecutive timeouts after which a call-mode loop returns
    #[serde(default = "default_call_mode_max_timeouts")]
    pub call_mode_max_timeouts: u32,

    /// Control-message layout version before negotiation
    #[serde(default)]
    pub initial_msg_version: u16,

    /// Host-pid bind polling interval
    #[serde(with = "duration_millis", default = "default_bind_poll_interval")]
    pub bind_poll_interval: Duration,

    /// Host-pid bind polling limit
    #[serde(with = "duration_secs", default = "default_bind_timeout")]
    pub bind_timeout: Duration,

    /// Attempts for a TS-directed async message
    #[serde(default = "default_ts_send_retries")]
    pub ts_send_retries: u32,

    #[serde(with = "duration_millis", default = "default_ts_send_retry_interval")]
    pub ts_send_retry_interval: Duration,

    /// Drop preprocess-enqueue notifications instead of forwarding them
    #[serde(default)]
    pub skip_enqueue_notify: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of the compact format
    #[serde(default)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_ids: default_device_ids(),
            host_pid: 0,
            vf_id: 0,
            sched_mode: default_sched_mode(),
            run_mode: default_run_mode(),
            deploy: default_deploy(),
            affinity: default_affinity(),
            cgroup_tasks_file: None,
            group_id: 0,
            event_wait_timeout: default_event_wait_timeout(),
            call_mode_max_timeouts: default_call_mode_max_timeouts(),
            initial_msg_version: 0,
            bind_poll_interval: default_bind_poll_interval(),
            bind_timeout: default_bind_timeout(),
            ts_send_retries: default_ts_send_retries(),
            ts_send_retry_interval: default_ts_send_retry_interval(),
            skip_enqueue_notify: false,
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from the working directory and environment.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::base_figment()
            .merge(Toml::file("aicpu-sched.toml"))
            .merge(Yaml::file("aicpu-sched.yaml")))
    }

    /// Load configuration from an explicit file (TOML or YAML by extension).
    pub fn load_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::base_figment().merge(Yaml::file(&path)),
            _ => Self::base_figment().merge(Toml::file(&path)),
        };
        Self::load_from(figment)
    }

    fn base_figment() -> Figment {
        use figment::providers::Serialized;
        Figment::from(Serialized::defaults(Config::default()))
    }

    fn load_from(figment: Figment) -> Result<Self> {
        let mut config: Config = figment
            .merge(Env::prefixed("AICPU_"))
            .extract()
            .map_err(|e| SchedError::Config(format!("Failed to load configuration: {}", e)))?;

        if env::var(affinity::PROCMGR_ENV).map(|v| v == "1").unwrap_or(false) {
            debug!("{} set, delegating affinity to process manager", affinity::PROCMGR_ENV);
            config.affinity = AffinityMode::ProcessManager;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.device_ids.is_empty() {
            return Err(SchedError::Config("device_ids cannot be empty".to_string()));
        }

        if let Some(bad) = self.device_ids.iter().find(|d| **d >= topology::DEVICE_NUM) {
            return Err(SchedError::Config(format!(
                "device id {} out of range (must be below {})",
                bad,
                topology::DEVICE_NUM
            )));
        }

        if self.event_wait_timeout.is_zero() {
            return Err(SchedError::Config(
                "event_wait_timeout must be non-zero".to_string(),
            ));
        }

        if self.ts_send_retries == 0 {
            return Err(SchedError::Config(
                "ts_send_retries must be at least 1".to_string(),
            ));
        }

        if self.vf_id > topology::DEVICE_MAX_SPLIT_NUM {
            return Err(SchedError::Config(format!(
                "vf_id {} exceeds {} partitions",
                self.vf_id,
                topology::DEVICE_MAX_SPLIT_NUM
            )));
        }

        Ok(())
    }

    /// Logging settings derived from this configuration.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            service_name: "aicpu-sched".to_string(),
            log_level: self.log_level.clone(),
            json: self.log_json,
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SchedError::Config(format!("Failed to render TOML: {}", e)))
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SchedError::Config(format!("Failed to render YAML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.event_wait_timeout, Duration::from_millis(3000));
        assert_eq!(config.call_mode_max_timeouts, 40);
        assert_eq!(config.ts_send_retries, 10);
    }

    #[test]
    fn test_validate_rejects_bad_devices() {
        let mut config = Config::default();
        config.device_ids.clear();
        assert!(config.validate().is_err());

        config.device_ids = vec![0, 64];
        assert!(matches!(config.validate(), Err(SchedError::Config(_))));
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "device_ids = [0, 1]\nsched_mode = \"msgq\"\nevent_wait_timeout = 500\ncall_mode_max_timeouts = 3"
        )
        .unwrap();

        let config = Config::load_file(file.path()).unwrap();
        assert_eq!(config.device_ids, vec![0, 1]);
        assert_eq!(config.sched_mode, SchedMode::Msgq);
        assert_eq!(config.event_wait_timeout, Duration::from_millis(500));
        assert_eq!(config.call_mode_max_timeouts, 3);
        assert_eq!(config.deploy, DeployContext::Device);
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "device_ids: [2]\ndeploy: host\nvf_id: 3").unwrap();

        let config = Config::load_file(file.path()).unwrap();
        assert_eq!(config.device_ids, vec![2]);
        assert_eq!(config.deploy, DeployContext::Host);
        assert_eq!(config.vf_id, 3);
    }

    #[test]
    fn test_render_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("sched_mode = \"interrupt\""));
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("deploy: device"));
    }
}
