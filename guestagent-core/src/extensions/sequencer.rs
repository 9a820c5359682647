//! Computes the ordered set of lifecycle transitions required to move the
//! machine from its current extension state to a goal state's desired state.
//!
//! Operations are grouped into dependency-level batches: teardown batches
//! (disable/uninstall) in descending level order first, then rollout batches
//! (install/enable/update) ascending. Every extension in a batch must reach a
//! terminal state before the next batch starts.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::warn;

use crate::extensions::types::{ExtensionRuntimeState, HandlerState};
use crate::wireserver::goal_state::{ExtensionConfig, GoalState, RequestedState};

/// A single required lifecycle transition for one extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Download, install and enable a not-yet-installed version
    InstallAndEnable,
    /// (Re-)enable an installed version, usually for a new settings sequence
    Enable,
    /// In-place version change via the handler's update command
    Update { from_version: String },
    /// Version change for handlers without update capability:
    /// disable + uninstall the old version, install + enable the new one
    Reinstall { from_version: String },
    Disable,
    Uninstall,
}

impl OperationKind {
    /// True for operations whose goal is a running extension; these gate on
    /// lower dependency levels completing first.
    pub fn is_rollout(&self) -> bool {
        !matches!(self, OperationKind::Disable | OperationKind::Uninstall)
    }

    /// State recorded when the operation is dispatched.
    pub fn dispatch_state(&self) -> HandlerState {
        match self {
            OperationKind::InstallAndEnable => HandlerState::Downloading,
            OperationKind::Enable => HandlerState::Enabling,
            OperationKind::Update { .. } | OperationKind::Reinstall { .. } => {
                HandlerState::Installing
            }
            OperationKind::Disable => HandlerState::Disabling,
            OperationKind::Uninstall => HandlerState::Uninstalling,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedOperation {
    pub config: ExtensionConfig,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Teardown,
    Rollout,
}

/// All operations at one dependency level, executed concurrently up to the
/// configured limit.
#[derive(Debug)]
pub struct LevelBatch {
    pub level: i32,
    pub phase: Phase,
    pub operations: Vec<PlannedOperation>,
}

#[derive(Debug, Default)]
pub struct TransitionPlan {
    pub batches: Vec<LevelBatch>,
}

impl TransitionPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.batches.iter().map(|b| b.operations.len()).sum()
    }
}

/// Compute the transition plan for a freshly applied goal state.
///
/// Idempotent by construction: an extension whose current state already
/// matches its desired configuration yields no operation.
pub fn build_plan(
    goal_state: &GoalState,
    current: &HashMap<String, ExtensionRuntimeState>,
) -> TransitionPlan {
    let mut teardown: BTreeMap<i32, Vec<PlannedOperation>> = BTreeMap::new();
    let mut rollout: BTreeMap<i32, Vec<PlannedOperation>> = BTreeMap::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for config in &goal_state.extensions {
        // At most one operation per extension name; a duplicated entry would
        // otherwise race two handlers over the same install directory
        if !seen.insert(&config.name) {
            warn!(extension = %config.name, "duplicate goal state entry ignored");
            continue;
        }
        let Some(kind) = plan_extension(config, current.get(&config.name)) else {
            continue;
        };
        let bucket = if kind.is_rollout() {
            &mut rollout
        } else {
            &mut teardown
        };
        bucket.entry(config.dependency_level).or_default().push(PlannedOperation {
            config: config.clone(),
            kind,
        });
    }

    let mut batches = Vec::with_capacity(teardown.len() + rollout.len());
    // Teardown traverses levels in descending order
    for (level, operations) in teardown.into_iter().rev() {
        batches.push(LevelBatch {
            level,
            phase: Phase::Teardown,
            operations,
        });
    }
    // Rollout traverses levels in ascending order
    for (level, operations) in rollout {
        batches.push(LevelBatch {
            level,
            phase: Phase::Rollout,
            operations,
        });
    }
    TransitionPlan { batches }
}

fn plan_extension(
    config: &ExtensionConfig,
    current: Option<&ExtensionRuntimeState>,
) -> Option<OperationKind> {
    let installed = current.filter(|rs| rs.state.is_installed());

    match config.requested_state {
        RequestedState::Enabled => match installed {
            None => Some(OperationKind::InstallAndEnable),
            Some(rs) if rs.version != config.version => {
                if rs.supports_update {
                    Some(OperationKind::Update {
                        from_version: rs.version.clone(),
                    })
                } else {
                    Some(OperationKind::Reinstall {
                        from_version: rs.version.clone(),
                    })
                }
            }
            Some(rs) => match rs.state {
                HandlerState::Enabled => {
                    // Same version: only a newer settings sequence forces a
                    // re-enable
                    if rs.last_sequence.map_or(true, |s| config.sequence_number > s) {
                        Some(OperationKind::Enable)
                    } else {
                        None
                    }
                }
                // A new goal state re-attempts a previously failed install
                // from the top
                HandlerState::Failed => Some(OperationKind::InstallAndEnable),
                _ => Some(OperationKind::Enable),
            },
        },
        RequestedState::Disabled => match installed {
            Some(rs) if matches!(rs.state, HandlerState::Enabled | HandlerState::Failed) => {
                Some(OperationKind::Disable)
            }
            _ => None,
        },
        RequestedState::Uninstall => installed.map(|_| OperationKind::Uninstall),
    }
}
