//! Wires the production engine together from settings.

use std::sync::Arc;

use semver::Version;
use tracing::warn;

use crate::agent::engine::Engine;
use crate::cgroups::ResourceGovernor;
use crate::config::{AgentSettings, AGENT_NAME, AGENT_VERSION, WIRESERVER_ENDPOINT};
use crate::error::AgentError;
use crate::extensions::ExtensionRuntime;
use crate::persist::StateStore;
use crate::update::AutoUpdateCoordinator;
use crate::wireserver::{TelemetrySink, WireClient};

/// Build the engine against the platform wire endpoint.
///
/// Continuity: polling resumes from the checkpointed incarnation. A corrupted
/// checkpoint is logged and discarded, which re-fetches the current goal state
/// rather than guessing at the last applied one.
pub fn build_engine(settings: AgentSettings) -> Result<Engine<WireClient, WireClient>, AgentError> {
    let store = StateStore::open(&settings.lib_dir)?;
    let last_incarnation = match store.load_checkpoint() {
        Ok(Some(checkpoint)) => checkpoint.incarnation,
        Ok(None) => 0,
        Err(e) => {
            warn!("checkpoint unreadable, starting from incarnation 0: {e}");
            0
        }
    };

    let mut governor = ResourceGovernor::new(&settings);
    governor.setup_agent();

    let wire = WireClient::new(WIRESERVER_ENDPOINT, AGENT_NAME, AGENT_VERSION);
    let runtime = ExtensionRuntime::new(store.clone(), Arc::new(wire.clone()), &settings);

    let updater = match (&settings.update_manifest_url, settings.auto_update_enabled) {
        (Some(manifest_url), true) => match Version::parse(AGENT_VERSION) {
            Ok(current) => Some(AutoUpdateCoordinator::new(
                wire.clone(),
                store.clone(),
                current,
                &settings.agent_family,
                manifest_url,
            )),
            Err(e) => {
                warn!("agent version is not semver, self-update disabled: {e}");
                None
            }
        },
        _ => None,
    };

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(wire.clone());
    Ok(Engine::new(
        settings,
        Arc::new(wire.clone()),
        wire,
        runtime,
        governor,
        store,
        updater,
        Some(telemetry),
        last_incarnation,
    ))
}
