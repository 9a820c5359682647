//! End-to-end engine loop tests against scripted goal state sources and real
//! handler child processes.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use guestagent_core::agent::{CancellationToken, Engine, EngineExit};
use guestagent_core::cgroups::ResourceGovernor;
use guestagent_core::config::AgentSettings;
use guestagent_core::error::{AgentError, ExtensionError, FetchError, StatusError};
use guestagent_core::extensions::ExtensionRuntime;
use guestagent_core::persist::StateStore;
use guestagent_core::wireserver::goal_state::{ExtensionConfig, GoalState, RequestedState};
use guestagent_core::wireserver::{
    GoalStateSource, Health, PackageFetcher, PollOutcome, StatusUploader, TelemetryData,
    TelemetrySink,
};

const ARTIFACT_OK: &str = r#"{"status":"success","code":0,"formattedMessage":{"lang":"en-US","message":"enabled"}}"#;

/// Serves queued goal states the way the wire client does: only an
/// incarnation strictly above the last applied one is returned as an update.
struct ScriptedSource {
    goals: Mutex<VecDeque<GoalState>>,
}

impl ScriptedSource {
    fn new(goals: Vec<GoalState>) -> Self {
        Self {
            goals: Mutex::new(goals.into()),
        }
    }
}

#[async_trait]
impl GoalStateSource for ScriptedSource {
    async fn poll(&self, last_incarnation: u64) -> Result<PollOutcome, FetchError> {
        let mut goals = self.goals.lock().unwrap();
        match goals.front() {
            Some(goal) if goal.incarnation > last_incarnation => {
                Ok(PollOutcome::Updated(goals.pop_front().unwrap()))
            }
            _ => Ok(PollOutcome::NoChange),
        }
    }
}

#[derive(Clone, Default)]
struct RecordingUploader {
    uploads: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StatusUploader for RecordingUploader {
    async fn upload(&self, _destination: &str, status_json: &str) -> Result<(), StatusError> {
        self.uploads.lock().unwrap().push(status_json.to_string());
        Ok(())
    }
}

/// Captures event names and reported health states.
#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<String>>>,
    healths: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn send_event(&self, event: &TelemetryData) -> Result<(), StatusError> {
        self.events
            .lock()
            .unwrap()
            .push(event.provider.event.event_data.name.clone());
        Ok(())
    }

    async fn send_health(&self, health: &Health) -> Result<(), StatusError> {
        self.healths
            .lock()
            .unwrap()
            .push(health.container.role_instance_list.role.health.state.clone());
        Ok(())
    }
}

struct NoFetch;

#[async_trait]
impl PackageFetcher for NoFetch {
    async fn fetch_package(&self, _location: &str, _dest: &Path) -> Result<(), ExtensionError> {
        Err(ExtensionError::Download("no network in tests".into()))
    }
}

fn test_settings(lib_dir: &Path) -> AgentSettings {
    AgentSettings {
        poll_interval: Duration::from_millis(100),
        status_interval: Duration::from_millis(150),
        operation_timeout: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(30),
        auto_update_enabled: false,
        cgroups_enabled: false,
        lib_dir: lib_dir.to_path_buf(),
        ..AgentSettings::default()
    }
}

fn extension(name: &str, state: RequestedState, seq: u64, level: i32) -> ExtensionConfig {
    ExtensionConfig {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        location: String::new(),
        requested_state: state,
        settings: None,
        sequence_number: seq,
        dependency_level: level,
    }
}

fn goal(incarnation: u64, extensions: Vec<ExtensionConfig>) -> GoalState {
    GoalState {
        incarnation,
        container_id: "c-1".into(),
        role_instance: "vm-0".into(),
        status_destination: "http://host/status".into(),
        extensions,
    }
}

/// Lay out an installed handler whose lifecycle commands are shell scripts.
fn install_handler(store: &StateStore, name: &str, enable_body: &str) {
    let dir = store.handler_dir(name, "1.0.0");
    std::fs::create_dir_all(dir.join("status")).unwrap();
    std::fs::create_dir_all(dir.join("config")).unwrap();
    let manifest = r#"[{
        "version": 1.0,
        "handlerManifest": {
            "installCommand": "sh install.sh",
            "enableCommand": "sh enable.sh",
            "disableCommand": "sh disable.sh",
            "uninstallCommand": "sh uninstall.sh"
        }
    }]"#;
    std::fs::write(dir.join("HandlerManifest.json"), manifest).unwrap();
    std::fs::write(dir.join("install.sh"), "touch installed.marker\n").unwrap();
    std::fs::write(dir.join("enable.sh"), enable_body).unwrap();
    std::fs::write(dir.join("disable.sh"), "touch disabled.marker\n").unwrap();
    std::fs::write(dir.join("uninstall.sh"), "touch uninstalled.marker\n").unwrap();
}

fn enable_writes_artifact() -> String {
    format!("echo '{}' > status/$ConfigSequenceNumber.status\n", ARTIFACT_OK)
}

fn spawn_engine(
    store: &StateStore,
    settings: AgentSettings,
    source: ScriptedSource,
    uploader: RecordingUploader,
    last_incarnation: u64,
) -> (JoinHandle<Result<EngineExit, AgentError>>, CancellationToken) {
    spawn_engine_with_sink(store, settings, source, uploader, None, last_incarnation)
}

fn spawn_engine_with_sink(
    store: &StateStore,
    settings: AgentSettings,
    source: ScriptedSource,
    uploader: RecordingUploader,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    last_incarnation: u64,
) -> (JoinHandle<Result<EngineExit, AgentError>>, CancellationToken) {
    let governor = ResourceGovernor::new(&settings);
    let runtime = ExtensionRuntime::new(store.clone(), Arc::new(NoFetch), &settings);
    let engine = Engine::new(
        settings,
        Arc::new(source),
        uploader,
        runtime,
        governor,
        store.clone(),
        None,
        telemetry,
        last_incarnation,
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(engine.run(shutdown.clone()));
    (handle, shutdown)
}

fn last_upload(uploader: &RecordingUploader) -> serde_json::Value {
    let uploads = uploader.uploads.lock().unwrap();
    serde_json::from_str(uploads.last().expect("no status was uploaded")).unwrap()
}

#[tokio::test]
async fn applies_goal_state_and_reports_status() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    install_handler(&store, "CustomScript", &enable_writes_artifact());

    let source = ScriptedSource::new(vec![goal(
        1,
        vec![extension("CustomScript", RequestedState::Enabled, 1, 0)],
    )]);
    let uploader = RecordingUploader::default();
    let (handle, shutdown) = spawn_engine(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        0,
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    let exit = handle.await.unwrap().unwrap();
    assert!(matches!(exit, EngineExit::Shutdown));

    assert_eq!(store.read_mrseq("CustomScript"), Some(1));
    assert_eq!(store.load_checkpoint().unwrap().unwrap().incarnation, 1);

    let doc = last_upload(&uploader);
    assert_eq!(doc["agentStatus"], "Ready");
    assert_eq!(doc["incarnation"], 1);
    assert_eq!(doc["extensions"]["CustomScript"]["state"], "Enabled");
    assert_eq!(doc["extensions"]["CustomScript"]["sequenceNumber"], 1);
}

#[tokio::test]
async fn failure_at_lower_level_blocks_higher_rollout() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    install_handler(&store, "A", "echo boom >&2; exit 3\n");
    install_handler(&store, "B", &enable_writes_artifact());
    install_handler(&store, "C", &enable_writes_artifact());

    let source = ScriptedSource::new(vec![goal(
        1,
        vec![
            extension("A", RequestedState::Enabled, 1, 0),
            extension("B", RequestedState::Enabled, 1, 0),
            extension("C", RequestedState::Enabled, 1, 1),
        ],
    )]);
    let uploader = RecordingUploader::default();
    let (handle, shutdown) = spawn_engine(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        0,
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let doc = last_upload(&uploader);
    // The failure stays contained to A's level peers finishing their work
    assert_eq!(doc["extensions"]["A"]["state"], "Failed");
    assert_eq!(doc["extensions"]["B"]["state"], "Enabled");
    // C was never dispatched
    assert_eq!(doc["extensions"]["C"]["state"], "Failed");
    assert!(doc["extensions"]["C"]["message"]
        .as_str()
        .unwrap()
        .contains("blocked"));
    assert!(!store
        .handler_dir("C", "1.0.0")
        .join("status")
        .join("1.status")
        .exists());
}

#[tokio::test]
async fn telemetry_and_health_ride_alongside_status_reports() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    install_handler(&store, "CustomScript", &enable_writes_artifact());

    let source = ScriptedSource::new(vec![goal(
        1,
        vec![extension("CustomScript", RequestedState::Enabled, 1, 0)],
    )]);
    let uploader = RecordingUploader::default();
    let sink = RecordingSink::default();
    let (handle, shutdown) = spawn_engine_with_sink(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        Some(Arc::new(sink.clone())),
        0,
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("AgentStart"));
    assert!(events.iter().any(|e| e == "HeartBeat"), "{events:?}");
    assert!(events.iter().any(|e| e == "AgentStatus"), "{events:?}");

    let healths = sink.healths.lock().unwrap().clone();
    assert!(!healths.is_empty());
    assert!(healths.iter().all(|h| h == "Ready"), "{healths:?}");
}

#[tokio::test]
async fn unchanged_incarnation_causes_no_transitions() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    install_handler(&store, "CustomScript", "touch enable.marker\n");

    // Engine resumes from incarnation 1; the platform still publishes 1
    let source = ScriptedSource::new(vec![goal(
        1,
        vec![extension("CustomScript", RequestedState::Enabled, 1, 0)],
    )]);
    let uploader = RecordingUploader::default();
    let (handle, shutdown) = spawn_engine(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        1,
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(!store
        .handler_dir("CustomScript", "1.0.0")
        .join("enable.marker")
        .exists());
    assert_eq!(store.read_mrseq("CustomScript"), None);
    // No goal state was ever applied in this run, so nothing was uploaded
    assert!(uploader.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn superseding_goal_state_cancels_stale_operation() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    // Sequence 1 hangs; sequence 2 completes immediately
    install_handler(
        &store,
        "Slow",
        &format!(
            "if [ \"$ConfigSequenceNumber\" -ge 2 ]; then {}; else sleep 30; fi\n",
            enable_writes_artifact().trim_end()
        ),
    );

    let source = ScriptedSource::new(vec![
        goal(1, vec![extension("Slow", RequestedState::Enabled, 1, 0)]),
        goal(2, vec![extension("Slow", RequestedState::Enabled, 2, 0)]),
    ]);
    let uploader = RecordingUploader::default();
    let (handle, shutdown) = spawn_engine(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        0,
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // The stale operation never finished; the superseding one did
    assert_eq!(store.read_mrseq("Slow"), Some(2));
    assert_eq!(store.load_checkpoint().unwrap().unwrap().incarnation, 2);
    let doc = last_upload(&uploader);
    assert_eq!(doc["extensions"]["Slow"]["state"], "Enabled");
    assert_eq!(doc["extensions"]["Slow"]["sequenceNumber"], 2);
}

#[tokio::test]
async fn superseding_goal_state_drops_undispatched_batches() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    // A holds its level long enough for incarnation 2 to arrive; its config
    // is identical in both goal states, so it is not cancelled
    install_handler(
        &store,
        "A",
        &format!("sleep 1\n{}", enable_writes_artifact()),
    );
    install_handler(&store, "B", &enable_writes_artifact());

    let source = ScriptedSource::new(vec![
        goal(
            1,
            vec![
                extension("A", RequestedState::Enabled, 1, 0),
                extension("B", RequestedState::Enabled, 1, 1),
            ],
        ),
        // Incarnation 2 no longer wants B
        goal(2, vec![extension("A", RequestedState::Enabled, 1, 0)]),
    ]);
    let uploader = RecordingUploader::default();
    let (handle, shutdown) = spawn_engine(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        0,
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(store.read_mrseq("A"), Some(1));
    assert_eq!(store.load_checkpoint().unwrap().unwrap().incarnation, 2);

    // B's queued level-1 batch from incarnation 1 must never have run
    let b_dir = store.handler_dir("B", "1.0.0");
    assert!(!b_dir.join("installed.marker").exists());
    assert!(!b_dir.join("status").join("1.status").exists());
    assert_eq!(store.read_mrseq("B"), None);
    let doc = last_upload(&uploader);
    assert_eq!(doc["extensions"]["A"]["state"], "Enabled");
    assert!(doc["extensions"].as_object().unwrap().get("B").is_none());
}

#[tokio::test]
async fn uninstall_clears_handler_and_state() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = StateStore::open(tmp.path()).unwrap();
    install_handler(&store, "Goner", &enable_writes_artifact());

    let source = ScriptedSource::new(vec![
        goal(1, vec![extension("Goner", RequestedState::Enabled, 1, 0)]),
        goal(2, vec![extension("Goner", RequestedState::Uninstall, 1, 0)]),
    ]);
    let uploader = RecordingUploader::default();
    let (handle, shutdown) = spawn_engine(
        &store,
        test_settings(tmp.path()),
        source,
        uploader.clone(),
        0,
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(!store.handler_dir("Goner", "1.0.0").exists());
    assert_eq!(store.read_mrseq("Goner"), None);
    let doc = last_upload(&uploader);
    assert!(doc["extensions"]
        .as_object()
        .unwrap()
        .get("Goner")
        .is_none());
}
