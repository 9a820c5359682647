//! Daemon entry point.
//!
//! Runs the engine loop until it is shut down or hands off to a staged
//! replacement version. Handoff replaces this process image, so the async
//! runtime is torn down first.

use std::process::ExitCode;

use guestagent_core::agent::{build_engine, CancellationToken, EngineExit};
use guestagent_core::config::AgentSettings;
use guestagent_core::error::AgentError;
use guestagent_core::update::PendingUpdate;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let exit = runtime.block_on(run());
    // No worker threads may survive into a potential exec
    drop(runtime);

    match exit {
        Ok(EngineExit::Shutdown) => {
            info!("agent stopped");
            ExitCode::SUCCESS
        }
        Ok(EngineExit::Handoff(pending)) => hand_off(pending),
        Err(e) => {
            error!("agent failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<EngineExit, AgentError> {
    let engine = build_engine(AgentSettings::default())?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            trigger.cancel();
        }
    });

    engine.run(shutdown).await
}

#[cfg(unix)]
fn hand_off(pending: PendingUpdate) -> ExitCode {
    use std::os::unix::process::CommandExt;

    let entrypoint = pending.entrypoint();
    info!(
        version = %pending.version,
        path = %entrypoint.display(),
        "handing off to replacement agent"
    );
    // exec only returns on failure
    let err = std::process::Command::new(&entrypoint).exec();
    error!("exec of replacement agent failed: {err}");
    ExitCode::FAILURE
}

#[cfg(not(unix))]
fn hand_off(pending: PendingUpdate) -> ExitCode {
    error!(version = %pending.version, "in-place handoff is only supported on unix");
    ExitCode::FAILURE
}
