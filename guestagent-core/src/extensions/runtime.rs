//! Executes a single lifecycle transition for one extension as an isolated,
//! time-bounded child process.
//!
//! Every launch runs in its own process group so that forced termination
//! covers the whole process tree. A hard wall-clock timeout bounds every
//! command; enable additionally runs under a heartbeat timeout driven by
//! status-artifact progress, since only enable is contracted to write one.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cgroups::Containment;
use crate::config::AgentSettings;
use crate::error::ExtensionError;
use crate::extensions::installer::{ensure_installed, LOGS_DIR, CONFIG_DIR, STATUS_DIR};
use crate::extensions::manifest::{HandlerAdapter, HandlerCommand};
use crate::extensions::sequencer::OperationKind;
use crate::extensions::types::{ExtensionStatus, HandlerState, StatusArtifact, StatusLevel};
use crate::persist::StateStore;
use crate::wireserver::goal_state::ExtensionConfig;
use crate::wireserver::PackageFetcher;

/// Result of one lifecycle operation, reported back to the engine loop over
/// the outcome channel. Workers never mutate engine state directly.
#[derive(Debug)]
pub struct OperationOutcome {
    pub name: String,
    pub version: String,
    pub kind: OperationKind,
    pub new_state: HandlerState,
    pub status: Option<ExtensionStatus>,
    pub error: Option<String>,
    /// Learned from the handler manifest; `None` when the adapter never loaded
    pub supports_update: Option<bool>,
    pub sequence_number: u64,
}

pub struct ExtensionRuntime {
    store: StateStore,
    fetcher: Arc<dyn PackageFetcher>,
    operation_timeout: Duration,
    heartbeat_timeout: Duration,
}

struct OperationSuccess {
    new_state: HandlerState,
    status: Option<ExtensionStatus>,
    supports_update: bool,
}

impl ExtensionRuntime {
    pub fn new(store: StateStore, fetcher: Arc<dyn PackageFetcher>, settings: &AgentSettings) -> Self {
        Self {
            store,
            fetcher,
            operation_timeout: settings.operation_timeout,
            heartbeat_timeout: settings.heartbeat_timeout,
        }
    }

    /// Execute one lifecycle transition to completion. Never panics and never
    /// returns an error: every failure is folded into the outcome record so
    /// it stays contained to this extension.
    pub async fn execute(
        &self,
        config: ExtensionConfig,
        kind: OperationKind,
        containment: Containment,
        cancel: CancellationToken,
    ) -> OperationOutcome {
        info!(extension = %config.name, version = %config.version, ?kind, "starting operation");
        match self.run_operation(&config, &kind, &containment, &cancel).await {
            Ok(success) => OperationOutcome {
                name: config.name,
                version: config.version,
                kind,
                new_state: success.new_state,
                status: success.status,
                error: None,
                supports_update: Some(success.supports_update),
                sequence_number: config.sequence_number,
            },
            Err(e) => {
                warn!(extension = %config.name, "operation failed: {e}");
                OperationOutcome {
                    name: config.name,
                    version: config.version,
                    kind,
                    new_state: HandlerState::Failed,
                    status: None,
                    error: Some(e.to_string()),
                    supports_update: None,
                    sequence_number: config.sequence_number,
                }
            }
        }
    }

    async fn run_operation(
        &self,
        config: &ExtensionConfig,
        kind: &OperationKind,
        containment: &Containment,
        cancel: &CancellationToken,
    ) -> Result<OperationSuccess, ExtensionError> {
        let dir = self.store.handler_dir(&config.name, &config.version);

        match kind {
            OperationKind::InstallAndEnable => {
                ensure_installed(self.fetcher.as_ref(), config, &dir).await?;
                let adapter = HandlerAdapter::load(&dir)?;
                self.run_command(&adapter, &dir, HandlerCommand::Install, config, containment, cancel)
                    .await?;
                let status = self.enable(&adapter, &dir, config, containment, cancel).await?;
                Ok(OperationSuccess {
                    new_state: HandlerState::Enabled,
                    status,
                    supports_update: adapter.supports_update(),
                })
            }
            OperationKind::Enable => {
                let adapter = HandlerAdapter::load(&dir)?;
                let status = self.enable(&adapter, &dir, config, containment, cancel).await?;
                Ok(OperationSuccess {
                    new_state: HandlerState::Enabled,
                    status,
                    supports_update: adapter.supports_update(),
                })
            }
            OperationKind::Update { from_version } => {
                let old_dir = self.store.handler_dir(&config.name, from_version);
                ensure_installed(self.fetcher.as_ref(), config, &dir).await?;
                let adapter = HandlerAdapter::load(&dir)?;

                if let Ok(old_adapter) = HandlerAdapter::load(&old_dir) {
                    self.run_command(&old_adapter, &old_dir, HandlerCommand::Disable, config, containment, cancel)
                        .await?;
                }
                self.run_command(&adapter, &dir, HandlerCommand::Update, config, containment, cancel)
                    .await?;
                if old_dir.exists() {
                    tokio::fs::remove_dir_all(&old_dir).await?;
                }
                let status = self.enable(&adapter, &dir, config, containment, cancel).await?;
                Ok(OperationSuccess {
                    new_state: HandlerState::Enabled,
                    status,
                    supports_update: adapter.supports_update(),
                })
            }
            OperationKind::Reinstall { from_version } => {
                let old_dir = self.store.handler_dir(&config.name, from_version);
                if let Ok(old_adapter) = HandlerAdapter::load(&old_dir) {
                    self.run_command(&old_adapter, &old_dir, HandlerCommand::Disable, config, containment, cancel)
                        .await?;
                    self.run_command(&old_adapter, &old_dir, HandlerCommand::Uninstall, config, containment, cancel)
                        .await?;
                }
                if old_dir.exists() {
                    tokio::fs::remove_dir_all(&old_dir).await?;
                }

                ensure_installed(self.fetcher.as_ref(), config, &dir).await?;
                let adapter = HandlerAdapter::load(&dir)?;
                self.run_command(&adapter, &dir, HandlerCommand::Install, config, containment, cancel)
                    .await?;
                let status = self.enable(&adapter, &dir, config, containment, cancel).await?;
                Ok(OperationSuccess {
                    new_state: HandlerState::Enabled,
                    status,
                    supports_update: adapter.supports_update(),
                })
            }
            OperationKind::Disable => {
                let adapter = HandlerAdapter::load(&dir)?;
                self.run_command(&adapter, &dir, HandlerCommand::Disable, config, containment, cancel)
                    .await?;
                Ok(OperationSuccess {
                    new_state: HandlerState::Disabled,
                    status: None,
                    supports_update: adapter.supports_update(),
                })
            }
            OperationKind::Uninstall => {
                let adapter = match HandlerAdapter::load(&dir) {
                    Ok(adapter) => adapter,
                    // Install directory already gone; nothing left to run
                    Err(_) => {
                        return Ok(OperationSuccess {
                            new_state: HandlerState::Removed,
                            status: None,
                            supports_update: false,
                        })
                    }
                };
                self.run_command(&adapter, &dir, HandlerCommand::Disable, config, containment, cancel)
                    .await?;
                self.run_command(&adapter, &dir, HandlerCommand::Uninstall, config, containment, cancel)
                    .await?;
                Ok(OperationSuccess {
                    new_state: HandlerState::Removed,
                    status: None,
                    supports_update: adapter.supports_update(),
                })
            }
        }
    }

    /// Enable with settings delivery, sequence-number replay rejection, and
    /// mandatory status artifact readback.
    async fn enable(
        &self,
        adapter: &HandlerAdapter,
        dir: &Path,
        config: &ExtensionConfig,
        containment: &Containment,
        cancel: &CancellationToken,
    ) -> Result<Option<ExtensionStatus>, ExtensionError> {
        if let Some(mrseq) = self.store.read_mrseq(&config.name) {
            if config.sequence_number <= mrseq {
                debug!(
                    extension = %config.name,
                    seq = config.sequence_number,
                    mrseq,
                    "sequence number already processed, skipping enable"
                );
                return Ok(Some(ExtensionStatus {
                    status: StatusLevel::Success,
                    code: 0,
                    message: format!(
                        "sequence number {} already processed",
                        config.sequence_number
                    ),
                    sequence_number: config.sequence_number,
                }));
            }
        }

        self.write_settings(dir, config).await?;
        self.run_command(adapter, dir, HandlerCommand::Enable, config, containment, cancel)
            .await?;

        let artifact = self.read_status_artifact(dir, config.sequence_number).await?;
        self.store
            .write_mrseq(&config.name, config.sequence_number)
            .map_err(|e| ExtensionError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Some(ExtensionStatus::from_artifact(
            artifact,
            config.sequence_number,
        )))
    }

    async fn write_settings(&self, dir: &Path, config: &ExtensionConfig) -> Result<(), ExtensionError> {
        let config_dir = dir.join(CONFIG_DIR);
        tokio::fs::create_dir_all(&config_dir).await?;
        let payload = serde_json::json!({
            "runtimeSettings": [{
                "handlerSettings": config.settings.clone().unwrap_or(serde_json::json!({})),
            }]
        });
        let path = config_dir.join(format!("{}.settings", config.sequence_number));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&payload).unwrap_or_default()).await?;
        Ok(())
    }

    async fn read_status_artifact(
        &self,
        dir: &Path,
        sequence_number: u64,
    ) -> Result<StatusArtifact, ExtensionError> {
        let path = dir.join(STATUS_DIR).join(format!("{}.status", sequence_number));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ExtensionError::MissingStatus(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| ExtensionError::MissingStatus(format!("{}: {}", path.display(), e)))
    }

    /// Launch one handler command and supervise it to completion.
    async fn run_command(
        &self,
        adapter: &HandlerAdapter,
        dir: &Path,
        verb: HandlerCommand,
        config: &ExtensionConfig,
        containment: &Containment,
        cancel: &CancellationToken,
    ) -> Result<(), ExtensionError> {
        let command_line = adapter.command(verb)?;

        let logs_dir = dir.join(LOGS_DIR);
        tokio::fs::create_dir_all(&logs_dir).await?;
        let stdout_path = logs_dir.join(format!("{}.{}.out", verb.as_str(), config.sequence_number));
        let stderr_path = logs_dir.join(format!("{}.{}.err", verb.as_str(), config.sequence_number));
        let stdout = std::fs::File::create(&stdout_path)?;
        let stderr = std::fs::File::create(&stderr_path)?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command_line)
            .current_dir(dir)
            .env("ConfigSequenceNumber", config.sequence_number.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(extension = %config.name, verb = verb.as_str(), command_line, "launching handler command");
        let mut child = cmd.spawn().map_err(ExtensionError::Spawn)?;
        if let Some(pid) = child.id() {
            containment.attach(pid);
        }

        // Install, disable and uninstall never write status artifacts, so
        // heartbeat silence means nothing for them
        let status_path = (verb == HandlerCommand::Enable).then(|| {
            dir.join(STATUS_DIR).join(format!("{}.status", config.sequence_number))
        });
        let exit = self.supervise(&mut child, status_path.as_deref(), cancel).await?;

        if !exit.success() {
            let code = exit.code().unwrap_or(-1);
            return Err(ExtensionError::NonZeroExit {
                code,
                stderr: read_tail(&stderr_path, 1024),
            });
        }
        Ok(())
    }

    /// Wait for the child under the wall-clock watchdog, plus the heartbeat
    /// watchdog when a status artifact path is expected to make progress.
    async fn supervise(
        &self,
        child: &mut Child,
        status_path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<std::process::ExitStatus, ExtensionError> {
        let deadline = tokio::time::Instant::now() + self.operation_timeout;
        let check_period = (self.heartbeat_timeout / 4).max(Duration::from_millis(100));
        let mut heartbeat = tokio::time::interval(check_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_mtime = status_path.and_then(file_mtime);
        let mut last_progress = tokio::time::Instant::now();

        loop {
            tokio::select! {
                exit = child.wait() => return Ok(exit?),
                _ = cancel.cancelled() => {
                    kill_process_tree(child).await;
                    return Err(ExtensionError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    kill_process_tree(child).await;
                    return Err(ExtensionError::Timeout(self.operation_timeout.as_secs()));
                }
                _ = heartbeat.tick() => {
                    let Some(path) = status_path else { continue };
                    let mtime = file_mtime(path);
                    if mtime != last_mtime {
                        last_mtime = mtime;
                        last_progress = tokio::time::Instant::now();
                    } else if last_progress.elapsed() >= self.heartbeat_timeout {
                        kill_process_tree(child).await;
                        return Err(ExtensionError::Hung(self.heartbeat_timeout.as_secs()));
                    }
                }
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Force-terminate the full process tree, not just the top-level process.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned as its own process group leader
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        warn!("failed to kill handler process: {e}");
    }
}

fn read_tail(path: &Path, limit: usize) -> String {
    let raw = std::fs::read(path).unwrap_or_default();
    let start = raw.len().saturating_sub(limit);
    String::from_utf8_lossy(&raw[start..]).trim().to_string()
}
