use std::path::Path;

use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ExtensionError;
use crate::extensions::manifest::HANDLER_MANIFEST_FILE;
use crate::wireserver::PackageFetcher;
use crate::wireserver::goal_state::ExtensionConfig;

pub const CONFIG_DIR: &str = "config";
pub const STATUS_DIR: &str = "status";
pub const LOGS_DIR: &str = "logs";
const PACKAGE_FILE: &str = "package.zip";
const HANDLER_ENVIRONMENT_FILE: &str = "HandlerEnvironment.json";

/// Make sure the handler package for `config` is present in `handler_dir`.
///
/// Idempotent: an existing directory with a handler manifest is left alone,
/// so re-presenting a goal state never re-downloads a package.
pub async fn ensure_installed(
    fetcher: &dyn PackageFetcher,
    config: &ExtensionConfig,
    handler_dir: &Path,
) -> Result<(), ExtensionError> {
    if handler_dir.join(HANDLER_MANIFEST_FILE).exists() {
        debug!(
            extension = %config.name,
            version = %config.version,
            "handler package already installed"
        );
        return Ok(());
    }

    tokio::fs::create_dir_all(handler_dir).await?;
    let package_path = handler_dir.join(PACKAGE_FILE);

    info!(extension = %config.name, version = %config.version, "downloading handler package");
    fetcher.fetch_package(&config.location, &package_path).await?;

    extract_package(&package_path, handler_dir).await?;
    tokio::fs::remove_file(&package_path).await?;

    for sub in [CONFIG_DIR, STATUS_DIR, LOGS_DIR] {
        tokio::fs::create_dir_all(handler_dir.join(sub)).await?;
    }
    write_handler_environment(config, handler_dir).await?;

    if !handler_dir.join(HANDLER_MANIFEST_FILE).exists() {
        return Err(ExtensionError::Extract(format!(
            "package for {} contains no {}",
            config.name, HANDLER_MANIFEST_FILE
        )));
    }
    Ok(())
}

async fn extract_package(package_path: &Path, handler_dir: &Path) -> Result<(), ExtensionError> {
    let output = Command::new("unzip")
        .arg("-o")
        .arg(package_path)
        .arg("-d")
        .arg(handler_dir)
        .output()
        .await
        .map_err(|e| ExtensionError::Extract(format!("failed to run unzip: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtensionError::Extract(stderr.trim().to_string()));
    }
    Ok(())
}

/// Write the `HandlerEnvironment.json` contract file the handler reads to
/// locate its config, status and log folders.
async fn write_handler_environment(
    config: &ExtensionConfig,
    handler_dir: &Path,
) -> Result<(), ExtensionError> {
    let environment = json!([{
        "version": 1.0,
        "handlerEnvironment": {
            "configFolder": handler_dir.join(CONFIG_DIR),
            "statusFolder": handler_dir.join(STATUS_DIR),
            "logFolder": handler_dir.join(LOGS_DIR),
        },
        "name": config.name,
    }]);
    tokio::fs::write(
        handler_dir.join(HANDLER_ENVIRONMENT_FILE),
        serde_json::to_vec_pretty(&environment)
            .map_err(|e| ExtensionError::Manifest(e.to_string()))?,
    )
    .await?;
    Ok(())
}
