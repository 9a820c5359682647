//! The engine loop.
//!
//! A single task owns every piece of lifecycle state: the applied goal state,
//! per-extension runtime records, the transition plan, and the in-flight
//! operation set. Polling, status upload, update checks and extension
//! operations all run as spawned workers that report back over one channel;
//! nothing outside this loop ever mutates engine state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cgroups::ResourceGovernor;
use crate::config::{AgentSettings, AGENT_NAME, AGENT_VERSION};
use crate::error::{AgentError, FetchError, StatusError, UpdateError};
use crate::extensions::sequencer::{build_plan, LevelBatch, Phase};
use crate::extensions::types::{ExtensionRuntimeState, HandlerState};
use crate::extensions::{ExtensionRuntime, OperationOutcome};
use crate::persist::{Checkpoint, StateStore};
use crate::status::{build_document, StatusDocument, StatusReporter};
use crate::update::{AutoUpdateCoordinator, PendingUpdate};
use crate::utils::get_rfc3339_timestamp;
use crate::wireserver::goal_state::{ExtensionConfig, GoalState};
use crate::wireserver::telemetry::{build_event, EventKind, TelemetrySink};
use crate::wireserver::{build_health, GoalStateSource, PollOutcome, StatusUploader};

const BLOCKED_MESSAGE: &str = "blocked: failure at a lower dependency level";
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The fields of an extension's desired config whose change invalidates a
/// pending or running operation.
fn config_unchanged(old: &ExtensionConfig, new: &ExtensionConfig) -> bool {
    old.version == new.version
        && old.requested_state == new.requested_state
        && old.sequence_number == new.sequence_number
}

/// Worker reports funneled back into the engine loop.
enum EngineMsg {
    Poll(Result<PollOutcome, FetchError>),
    Op(OperationOutcome),
    Update(Result<Option<PendingUpdate>, UpdateError>),
    Report(Result<bool, StatusError>),
}

/// Why the engine loop returned.
#[derive(Debug)]
pub enum EngineExit {
    Shutdown,
    /// A verified replacement version is staged; the caller execs into it.
    Handoff(PendingUpdate),
}

pub struct Engine<S, U>
where
    S: GoalStateSource + 'static,
    U: StatusUploader + 'static,
{
    settings: AgentSettings,
    source: Arc<S>,
    reporter: Arc<Mutex<StatusReporter<U>>>,
    runtime: Arc<ExtensionRuntime>,
    governor: ResourceGovernor,
    store: StateStore,
    updater: Option<Arc<Mutex<AutoUpdateCoordinator>>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,

    /// Per-extension records, owned exclusively by this loop
    states: HashMap<String, ExtensionRuntimeState>,
    last_incarnation: u64,
    current: Option<GoalState>,
    /// Accepted but not yet promoted; promotion waits for a drained plan
    next_goal: Option<GoalState>,
    plan: VecDeque<LevelBatch>,
    outstanding: usize,
    rollout_blocked: bool,
    in_flight: HashMap<String, CancellationToken>,
    limiter: Arc<Semaphore>,

    tx: mpsc::Sender<EngineMsg>,
    /// Taken by `run`; the loop owns the receiving end for its lifetime
    rx: Option<mpsc::Receiver<EngineMsg>>,
    poll_in_flight: bool,
    report_in_flight: bool,
    update_in_flight: bool,
    pending_update: Option<PendingUpdate>,
    last_fetch_error: Option<String>,
    report_count: u64,
    start_event_sent: bool,
}

impl<S, U> Engine<S, U>
where
    S: GoalStateSource + 'static,
    U: StatusUploader + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: AgentSettings,
        source: Arc<S>,
        uploader: U,
        runtime: ExtensionRuntime,
        governor: ResourceGovernor,
        store: StateStore,
        updater: Option<AutoUpdateCoordinator>,
        telemetry: Option<Arc<dyn TelemetrySink>>,
        last_incarnation: u64,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            limiter: Arc::new(Semaphore::new(settings.concurrency_limit)),
            settings,
            source,
            reporter: Arc::new(Mutex::new(StatusReporter::new(uploader))),
            runtime: Arc::new(runtime),
            governor,
            store,
            updater: updater.map(|u| Arc::new(Mutex::new(u))),
            telemetry,
            states: HashMap::new(),
            last_incarnation,
            current: None,
            next_goal: None,
            plan: VecDeque::new(),
            outstanding: 0,
            rollout_blocked: false,
            in_flight: HashMap::new(),
            tx,
            rx: Some(rx),
            poll_in_flight: false,
            report_in_flight: false,
            update_in_flight: false,
            pending_update: None,
            last_fetch_error: None,
            report_count: 0,
            start_event_sent: false,
        }
    }

    /// Run until cancelled or until a staged update is ready for handoff.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<EngineExit, AgentError> {
        info!(
            version = AGENT_VERSION,
            incarnation = self.last_incarnation,
            "engine starting"
        );
        let mut rx = self.rx.take().ok_or(AgentError::ChannelClosed)?;
        let mut poll_tick = interval(self.settings.poll_interval);
        let mut status_tick = interval(self.settings.status_interval);
        let mut update_tick = interval(self.settings.effective_update_interval());
        for tick in [&mut poll_tick, &mut status_tick, &mut update_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, cancelling in-flight operations");
                    self.abort_in_flight(&mut rx).await;
                    return Ok(EngineExit::Shutdown);
                }
                _ = poll_tick.tick() => self.spawn_poll(),
                _ = status_tick.tick() => self.spawn_report(),
                _ = update_tick.tick(), if self.wants_update_check() => self.spawn_update_check(),
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    // The loop holds its own sender, so this cannot happen
                    // while the engine is alive
                    None => return Err(AgentError::ChannelClosed),
                },
            }

            self.advance()?;
            if self.drained() {
                if let Some(pending) = self.pending_update.take() {
                    self.finalize_for_handoff(&pending).await?;
                    return Ok(EngineExit::Handoff(pending));
                }
            }
        }
    }

    fn drained(&self) -> bool {
        self.plan.is_empty() && self.outstanding == 0 && self.next_goal.is_none()
    }

    fn wants_update_check(&self) -> bool {
        self.settings.auto_update_enabled
            && self.updater.is_some()
            && !self.update_in_flight
            && self.pending_update.is_none()
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Poll(result) => {
                self.poll_in_flight = false;
                match result {
                    Ok(PollOutcome::NoChange) => self.last_fetch_error = None,
                    Ok(PollOutcome::Updated(goal_state)) => {
                        self.last_fetch_error = None;
                        self.accept_goal(goal_state);
                    }
                    Err(e) => {
                        // The previously applied goal state stays authoritative
                        warn!("goal state poll failed: {e}");
                        self.last_fetch_error = Some(e.to_string());
                    }
                }
            }
            EngineMsg::Op(outcome) => self.apply_outcome(outcome),
            EngineMsg::Update(result) => {
                self.update_in_flight = false;
                match result {
                    Ok(Some(pending)) => {
                        info!(version = %pending.version, "agent update staged, waiting for drain");
                        self.pending_update = Some(pending);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("agent update check failed: {e}"),
                }
            }
            EngineMsg::Report(result) => {
                self.report_in_flight = false;
                if let Err(e) = result {
                    warn!("status report failed: {e}");
                }
            }
        }
    }

    /// Record a freshly fetched goal state, cancel in-flight operations it
    /// supersedes and drop queued operations whose config it changed.
    /// Promotion happens once the current plan drains.
    fn accept_goal(&mut self, goal_state: GoalState) {
        info!(
            incarnation = goal_state.incarnation,
            extensions = goal_state.extensions.len(),
            "accepted new goal state"
        );
        for (name, token) in &self.in_flight {
            let stale = match (self.desired(name), goal_state.extension(name)) {
                (Some(old), Some(new)) => !config_unchanged(old, new),
                _ => true,
            };
            if stale {
                info!(extension = %name, "cancelling superseded operation");
                token.cancel();
            }
        }
        // Not-yet-dispatched operations survive only if the new goal state
        // still wants the exact same config
        for batch in &mut self.plan {
            batch.operations.retain(|op| {
                let keep = goal_state
                    .extension(&op.config.name)
                    .is_some_and(|new| config_unchanged(&op.config, new));
                if !keep {
                    info!(extension = %op.config.name, "dropping superseded queued operation");
                }
                keep
            });
        }
        self.plan.retain(|batch| !batch.operations.is_empty());
        self.next_goal = Some(goal_state);
    }

    fn desired(&self, name: &str) -> Option<&ExtensionConfig> {
        self.current.as_ref().and_then(|gs| gs.extension(name))
    }

    /// Drive the plan forward: dispatch the next batch once the previous one
    /// is fully terminal, and promote a waiting goal state once drained.
    fn advance(&mut self) -> Result<(), AgentError> {
        loop {
            if self.outstanding > 0 {
                return Ok(());
            }
            if let Some(batch) = self.plan.pop_front() {
                self.dispatch(batch);
                continue;
            }
            match self.next_goal.take() {
                Some(goal_state) => self.promote(goal_state)?,
                None => return Ok(()),
            }
        }
    }

    fn promote(&mut self, goal_state: GoalState) -> Result<(), AgentError> {
        let plan = build_plan(&goal_state, &self.states);
        info!(
            incarnation = goal_state.incarnation,
            operations = plan.operation_count(),
            "applying goal state"
        );
        self.plan = plan.batches.into();
        self.rollout_blocked = false;
        self.last_incarnation = goal_state.incarnation;
        self.current = Some(goal_state);
        self.store.save_checkpoint(&Checkpoint {
            incarnation: self.last_incarnation,
            agent_version: AGENT_VERSION.to_string(),
            timestamp: get_rfc3339_timestamp(),
        })?;
        if !self.start_event_sent {
            self.start_event_sent = true;
            self.emit_event(EventKind::AgentStart);
        }
        Ok(())
    }

    fn dispatch(&mut self, batch: LevelBatch) {
        if self.rollout_blocked && batch.phase == Phase::Rollout {
            for op in batch.operations {
                warn!(
                    extension = %op.config.name,
                    level = batch.level,
                    "not dispatched: {BLOCKED_MESSAGE}"
                );
                let record = self
                    .states
                    .entry(op.config.name.clone())
                    .or_insert_with(|| ExtensionRuntimeState::new(&op.config.version));
                record.state = HandlerState::Failed;
                record.last_error = Some(BLOCKED_MESSAGE.to_string());
                record.last_status = None;
            }
            return;
        }

        debug!(
            level = batch.level,
            phase = ?batch.phase,
            operations = batch.operations.len(),
            "dispatching batch"
        );
        for op in batch.operations {
            let record = self
                .states
                .entry(op.config.name.clone())
                .or_insert_with(|| ExtensionRuntimeState::new(&op.config.version));
            record.state = op.kind.dispatch_state();
            record.last_error = None;

            let cancel = CancellationToken::new();
            self.in_flight.insert(op.config.name.clone(), cancel.clone());
            let containment = self.governor.prepare(&op.config.name);
            let runtime = self.runtime.clone();
            let limiter = self.limiter.clone();
            let tx = self.tx.clone();
            self.outstanding += 1;
            tokio::spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                let outcome = runtime.execute(op.config, op.kind, containment, cancel).await;
                let _ = tx.send(EngineMsg::Op(outcome)).await;
            });
        }
    }

    fn apply_outcome(&mut self, outcome: OperationOutcome) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.in_flight.remove(&outcome.name);

        if outcome.new_state == HandlerState::Removed {
            info!(extension = %outcome.name, version = %outcome.version, "extension removed");
            self.governor.teardown(&outcome.name);
            if let Err(e) = self.store.remove_handler(&outcome.name, &outcome.version) {
                warn!(extension = %outcome.name, "failed to clean up removed handler: {e}");
            }
            self.states.remove(&outcome.name);
            return;
        }

        let failed_rollout = outcome.new_state == HandlerState::Failed && outcome.kind.is_rollout();
        let record = self
            .states
            .entry(outcome.name.clone())
            .or_insert_with(|| ExtensionRuntimeState::new(&outcome.version));
        record.state = outcome.new_state;
        if let Some(supports) = outcome.supports_update {
            record.supports_update = supports;
        }
        match outcome.error {
            Some(error) => {
                record.retry_count += 1;
                record.last_error = Some(error);
            }
            None => {
                record.retry_count = 0;
                record.last_error = None;
                record.version = outcome.version;
                if outcome.new_state == HandlerState::Enabled {
                    record.last_sequence = Some(outcome.sequence_number);
                }
            }
        }
        if let Some(status) = outcome.status {
            record.last_status = Some(status);
        }

        if failed_rollout {
            self.rollout_blocked = true;
        }
    }

    fn spawn_poll(&mut self) {
        if self.poll_in_flight {
            return;
        }
        self.poll_in_flight = true;
        let source = self.source.clone();
        let tx = self.tx.clone();
        let last_incarnation = self.last_incarnation;
        tokio::spawn(async move {
            let result = source.poll(last_incarnation).await;
            let _ = tx.send(EngineMsg::Poll(result)).await;
        });
    }

    fn spawn_report(&mut self) {
        if self.report_in_flight {
            return;
        }
        // No goal state yet means no destination to report to
        let Some(destination) = self
            .current
            .as_ref()
            .map(|gs| gs.status_destination.clone())
        else {
            return;
        };
        self.report_in_flight = true;
        self.report_count += 1;
        // Telemetry rides alongside the report: liveness and agent-status
        // events alternate, the health document goes out every cycle
        let kind = if self.report_count % 2 == 0 {
            EventKind::AgentStatus
        } else {
            EventKind::HeartBeat
        };
        self.emit_event(kind);
        self.emit_health();
        let document = self.build_status_document();
        let reporter = self.reporter.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = reporter.lock().await.report(&document, &destination).await;
            let _ = tx.send(EngineMsg::Report(result)).await;
        });
    }

    fn spawn_update_check(&mut self) {
        let Some(updater) = self.updater.clone() else {
            return;
        };
        self.update_in_flight = true;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = updater.lock().await.check_for_update().await;
            let _ = tx.send(EngineMsg::Update(result)).await;
        });
    }

    /// Fire-and-forget: a dropped event never blocks or faults the loop.
    fn emit_event(&self, kind: EventKind) {
        let (Some(sink), Some(gs)) = (self.telemetry.as_ref(), self.current.as_ref()) else {
            return;
        };
        let event = build_event(kind, gs, AGENT_NAME, AGENT_VERSION);
        let sink = sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.send_event(&event).await {
                debug!("telemetry event dropped: {e}");
            }
        });
    }

    fn emit_health(&self) {
        let (Some(sink), Some(gs)) = (self.telemetry.as_ref(), self.current.as_ref()) else {
            return;
        };
        let health = build_health(gs, self.last_fetch_error.is_none());
        let sink = sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.send_health(&health).await {
                debug!("health report dropped: {e}");
            }
        });
    }

    fn build_status_document(&self) -> StatusDocument {
        build_document(
            AGENT_NAME,
            AGENT_VERSION,
            self.last_incarnation,
            self.last_fetch_error.as_deref(),
            &self.states,
        )
    }

    /// Persist the continuity checkpoint and push a final status report so
    /// the replacement version starts from a clean, observable baseline.
    async fn finalize_for_handoff(&mut self, pending: &PendingUpdate) -> Result<(), AgentError> {
        info!(version = %pending.version, "drained, finalizing for handoff");
        self.store.save_checkpoint(&Checkpoint {
            incarnation: self.last_incarnation,
            agent_version: pending.version.to_string(),
            timestamp: get_rfc3339_timestamp(),
        })?;

        if let Some(destination) = self
            .current
            .as_ref()
            .map(|gs| gs.status_destination.clone())
        {
            let document = self.build_status_document();
            if let Err(e) = self
                .reporter
                .lock()
                .await
                .report(&document, &destination)
                .await
            {
                warn!("final status report before handoff failed: {e}");
            }
        }
        Ok(())
    }

    /// Cancel everything in flight and collect outcomes within a bounded
    /// window, so child process trees are reaped before the loop returns.
    async fn abort_in_flight(&mut self, rx: &mut mpsc::Receiver<EngineMsg>) {
        for token in self.in_flight.values() {
            token.cancel();
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.outstanding > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(EngineMsg::Op(outcome))) => self.apply_outcome(outcome),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }
}
