use std::path::PathBuf;
use std::time::Duration;

use super::constants::*;

/// Runtime settings consumed by the engine.
///
/// Values arrive already validated from the configuration-loading collaborator;
/// the engine never re-parses configuration files itself.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub poll_interval: Duration,
    pub status_interval: Duration,
    pub update_interval: Duration,
    pub concurrency_limit: usize,
    pub operation_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub auto_update_enabled: bool,
    pub cgroups_enabled: bool,
    /// Update channel (agent family) eligible for self-update
    pub agent_family: String,
    /// Location of the published agent family manifest; `None` disables
    /// self-update regardless of `auto_update_enabled`
    pub update_manifest_url: Option<String>,
    /// Base directory for engine-owned persisted state and handler packages
    pub lib_dir: PathBuf,
    pub cgroup_root: PathBuf,
    /// CPU quota applied to each extension cgroup, in percent of one core
    pub cpu_quota_percent: Option<u32>,
    /// Memory ceiling applied to each extension cgroup, in bytes
    pub memory_max_bytes: Option<u64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            status_interval: DEFAULT_STATUS_INTERVAL,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            auto_update_enabled: true,
            cgroups_enabled: true,
            agent_family: "Prod".to_string(),
            update_manifest_url: None,
            lib_dir: PathBuf::from(DEFAULT_LIB_DIR),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            cpu_quota_percent: Some(75),
            memory_max_bytes: None,
        }
    }
}

impl AgentSettings {
    /// Effective update check interval, never below the hard floor.
    pub fn effective_update_interval(&self) -> Duration {
        self.update_interval.max(UPDATE_INTERVAL_FLOOR)
    }
}
