//! Engine configuration
//!
//! Every tunable the component engine reads is carried in [`EngineConfig`]
//! and handed to the engine at construction. Durations are written in
//! humantime form in the YAML file (`90s`, `2m`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wait for role labels once every pod is ready
pub const DEFAULT_ROLE_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
/// A failing container is only reported after this long
pub const DEFAULT_POD_CONTAINER_FAILED_TIMEOUT: Duration = Duration::from_secs(60);
/// An unschedulable pod is only reported after this long
pub const DEFAULT_POD_SCHEDULED_FAILED_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PROBE_REQUEUE_AFTER: Duration = Duration::from_secs(10);
pub const DEFAULT_FAILED_POD_REQUEUE_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_MEMBER_LEAVE_REQUEUE_AFTER: Duration = Duration::from_secs(10);
pub const DEFAULT_MEMBER_AGENT_PORT: u16 = 3501;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Recreate a PVC on its retained volume when in-place expansion failed
    pub recover_volume_expansion_failure: bool,

    /// When false the snapshot data-clone strategy is never chosen
    pub volume_snapshot_enabled: bool,

    #[serde(with = "humantime_serde")]
    pub role_probe_timeout_after_pods_ready: Duration,

    #[serde(with = "humantime_serde")]
    pub pod_container_failed_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub pod_scheduled_failed_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub probe_requeue_after: Duration,

    #[serde(with = "humantime_serde")]
    pub failed_pod_requeue_after: Duration,

    /// Retry of a scale-in whose leaving replica refused to quit its group
    #[serde(with = "humantime_serde")]
    pub member_leave_requeue_after: Duration,

    pub member_agent_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recover_volume_expansion_failure: false,
            volume_snapshot_enabled: true,
            role_probe_timeout_after_pods_ready: DEFAULT_ROLE_PROBE_TIMEOUT,
            pod_container_failed_timeout: DEFAULT_POD_CONTAINER_FAILED_TIMEOUT,
            pod_scheduled_failed_timeout: DEFAULT_POD_SCHEDULED_FAILED_TIMEOUT,
            probe_requeue_after: DEFAULT_PROBE_REQUEUE_AFTER,
            failed_pod_requeue_after: DEFAULT_FAILED_POD_REQUEUE_AFTER,
            member_leave_requeue_after: DEFAULT_MEMBER_LEAVE_REQUEUE_AFTER,
            member_agent_port: DEFAULT_MEMBER_AGENT_PORT,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
            .map_err(|e| Error::ConfigError(format!("parse engine config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("read \"{}\": {}", path.display(), e)))?;
        Self::from_yaml(&contents).map_err(|e| match e {
            Error::ConfigError(msg) => Error::ConfigError(format!("\"{}\": {}", path.display(), msg)),
            other => other,
        })
    }
}
