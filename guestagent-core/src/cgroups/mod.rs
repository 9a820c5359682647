//! Resource governor: cgroup v2 accounting and limiting for the agent and for
//! each extension. Containment is a safety net, not a correctness requirement;
//! every failure here logs and falls open to unconfined execution.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{AgentSettings, CGROUP_SLICE};

/// Containment boundary prepared for one unit. Workers attach the child pid
/// after spawn; `None` procs path means the unit runs unconfined.
#[derive(Debug, Clone, Default)]
pub struct Containment {
    procs_path: Option<PathBuf>,
}

impl Containment {
    pub fn unconfined() -> Self {
        Self::default()
    }

    pub fn is_enforced(&self) -> bool {
        self.procs_path.is_some()
    }

    /// Move a freshly spawned process into the boundary. Fail-open: a write
    /// failure is logged and the process keeps running unconfined.
    pub fn attach(&self, pid: u32) {
        let Some(procs) = &self.procs_path else {
            return;
        };
        if let Err(e) = fs::write(procs, pid.to_string()) {
            warn!(pid, path = %procs.display(), "failed to attach process to cgroup: {e}");
        }
    }
}

#[derive(Debug)]
pub struct ResourceGovernor {
    slice_dir: PathBuf,
    enabled: bool,
    cpu_quota_percent: Option<u32>,
    memory_max_bytes: Option<u64>,
    /// Units whose boundary could not be created; enforcement stays off for
    /// them until the agent restarts.
    broken: HashSet<String>,
}

impl ResourceGovernor {
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            slice_dir: settings.cgroup_root.join(CGROUP_SLICE),
            enabled: settings.cgroups_enabled,
            cpu_quota_percent: settings.cpu_quota_percent,
            memory_max_bytes: settings.memory_max_bytes,
            broken: HashSet::new(),
        }
    }

    /// Create the agent's own boundary and move the current process into it.
    pub fn setup_agent(&mut self) {
        if !self.enabled {
            return;
        }
        let containment = self.prepare("agent");
        if containment.is_enforced() {
            containment.attach(std::process::id());
            info!("agent placed in {}", self.slice_dir.join("agent").display());
        }
    }

    /// Lazily create the containment boundary for a unit and apply limits.
    pub fn prepare(&mut self, unit: &str) -> Containment {
        if !self.enabled || self.broken.contains(unit) {
            return Containment::unconfined();
        }
        match self.create_boundary(unit) {
            Ok(dir) => {
                debug!(unit, dir = %dir.display(), "containment boundary ready");
                Containment {
                    procs_path: Some(dir.join("cgroup.procs")),
                }
            }
            Err(e) => {
                warn!(unit, "containment setup failed, running unconfined: {e}");
                self.broken.insert(unit.to_string());
                Containment::unconfined()
            }
        }
    }

    fn create_boundary(&self, unit: &str) -> std::io::Result<PathBuf> {
        let dir = self.slice_dir.join(unit);
        fs::create_dir_all(&dir)?;
        if let Some(pct) = self.cpu_quota_percent {
            // cgroup v2 cpu.max: "<quota> <period>" in microseconds
            let quota = 100_000u64 * pct as u64 / 100;
            write_limit(&dir.join("cpu.max"), &format!("{} 100000", quota))?;
        }
        if let Some(max) = self.memory_max_bytes {
            write_limit(&dir.join("memory.max"), &max.to_string())?;
        }
        Ok(dir)
    }

    /// Tear down an extension's boundary once it has reached `Removed`.
    pub fn teardown(&mut self, unit: &str) {
        self.broken.remove(unit);
        if !self.enabled {
            return;
        }
        let dir = self.slice_dir.join(unit);
        if !dir.exists() {
            return;
        }
        // An rmdir failure usually means a straggler process; leave the group
        // for the next teardown attempt.
        if let Err(e) = fs::remove_dir(&dir) {
            warn!(unit, "failed to remove cgroup: {e}");
        }
    }
}

fn write_limit(path: &Path, value: &str) -> std::io::Result<()> {
    // Controller files only exist on a real cgroup2 mount with the controller
    // enabled; creating them on plain filesystems (tests) is acceptable.
    fs::write(path, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn settings(root: &Path, enabled: bool) -> AgentSettings {
        AgentSettings {
            cgroups_enabled: enabled,
            cgroup_root: root.to_path_buf(),
            cpu_quota_percent: Some(50),
            memory_max_bytes: Some(256 * 1024 * 1024),
            ..AgentSettings::default()
        }
    }

    #[test]
    fn prepare_creates_boundary_with_limits() {
        let root = TempDir::new().unwrap();
        let mut governor = ResourceGovernor::new(&settings(root.path(), true));

        let containment = governor.prepare("CustomScript");
        assert!(containment.is_enforced());

        let dir = root.path().join(CGROUP_SLICE).join("CustomScript");
        assert_eq!(fs::read_to_string(dir.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(
            fs::read_to_string(dir.join("memory.max")).unwrap(),
            (256 * 1024 * 1024u64).to_string()
        );
    }

    #[test]
    fn disabled_governor_is_unconfined() {
        let root = TempDir::new().unwrap();
        let mut governor = ResourceGovernor::new(&settings(root.path(), false));
        assert!(!governor.prepare("CustomScript").is_enforced());
    }

    #[test]
    fn creation_failure_falls_open_and_is_remembered() {
        let root = TempDir::new().unwrap();
        let mut s = settings(root.path(), true);
        // Point the hierarchy at a file so directory creation must fail
        let bogus = root.path().join("not-a-dir");
        fs::write(&bogus, b"x").unwrap();
        s.cgroup_root = bogus;

        let mut governor = ResourceGovernor::new(&s);
        assert!(!governor.prepare("CustomScript").is_enforced());
        assert!(governor.broken.contains("CustomScript"));
        // Subsequent calls stay unconfined without retrying
        assert!(!governor.prepare("CustomScript").is_enforced());
    }

    #[test]
    fn teardown_removes_empty_boundary() {
        let root = TempDir::new().unwrap();
        let mut governor = ResourceGovernor::new(&settings(root.path(), true));
        governor.prepare("Monitor");

        let dir = root.path().join(CGROUP_SLICE).join("Monitor");
        // remove_dir requires an empty directory; clear the limit files the
        // test filesystem materialized
        for entry in fs::read_dir(&dir).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        governor.teardown("Monitor");
        assert!(!dir.exists());
    }
}
