//! Auto-update coordinator.
//!
//! Discovers published agent versions on an independent cadence, verifies a
//! candidate package before extraction, and installs it to a version-isolated
//! directory. The running version is never touched: the engine loop drains to
//! a safe checkpoint and the daemon hands execution off to the new binary.

use std::path::PathBuf;
use std::time::Duration;

use semver::Version;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UPDATE_INTERVAL_FLOOR;
use crate::error::UpdateError;
use crate::persist::StateStore;
use crate::wireserver::WireClient;

/// Agent family manifest document published by the platform.
#[derive(Debug, Deserialize)]
pub struct AgentManifestDocument {
    #[serde(rename = "Family", default)]
    pub families: Vec<AgentFamily>,
}

#[derive(Debug, Deserialize)]
pub struct AgentFamily {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Package", default)]
    pub packages: Vec<AgentPackage>,
}

#[derive(Debug, Deserialize)]
pub struct AgentPackage {
    #[serde(rename = "@version")]
    pub version: Version,
    #[serde(rename = "@uri")]
    pub uri: String,
    #[serde(rename = "@sha256", default)]
    pub sha256: String,
    #[serde(rename = "@enabled", default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AgentManifestDocument {
    pub fn versions_for_family(&self, family: &str) -> Vec<AgentVersion> {
        self.families
            .iter()
            .filter(|f| f.name == family)
            .flat_map(|f| &f.packages)
            .map(|p| AgentVersion {
                version: p.version.clone(),
                location: p.uri.clone(),
                checksum: p.sha256.clone(),
                enabled: p.enabled,
            })
            .collect()
    }
}

/// One discoverable agent version.
#[derive(Debug, Clone)]
pub struct AgentVersion {
    pub version: Version,
    pub location: String,
    pub checksum: String,
    pub enabled: bool,
}

/// A verified, extracted agent version awaiting handoff.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub version: Version,
    pub install_dir: PathBuf,
}

impl PendingUpdate {
    /// Entry point of the replacement agent binary.
    pub fn entrypoint(&self) -> PathBuf {
        self.install_dir.join("guestagent")
    }
}

pub struct AutoUpdateCoordinator {
    wire: WireClient,
    store: StateStore,
    current_version: Version,
    family: String,
    manifest_url: String,
    min_interval: Duration,
    last_attempt: Option<Instant>,
    /// Candidate that failed verification or extraction; not re-attempted
    /// until a later check window
    last_failed: Option<Version>,
}

impl AutoUpdateCoordinator {
    pub fn new(
        wire: WireClient,
        store: StateStore,
        current_version: Version,
        family: &str,
        manifest_url: &str,
    ) -> Self {
        Self {
            wire,
            store,
            current_version,
            family: family.to_string(),
            manifest_url: manifest_url.to_string(),
            // Interval floor holds even under misconfiguration
            min_interval: UPDATE_INTERVAL_FLOOR,
            last_attempt: None,
            last_failed: None,
        }
    }

    #[cfg(test)]
    fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Discover, verify and install the highest eligible agent version.
    ///
    /// `Ok(None)` means no update is due or available. Any error leaves the
    /// currently running version untouched.
    pub async fn check_for_update(&mut self) -> Result<Option<PendingUpdate>, UpdateError> {
        if let Some(last) = self.last_attempt {
            if last.elapsed() < self.min_interval {
                debug!("update check throttled by minimum interval floor");
                return Ok(None);
            }
        }
        self.last_attempt = Some(Instant::now());

        let versions = self
            .wire
            .fetch_agent_manifest(&self.manifest_url, &self.family)
            .await?;

        let Some(candidate) = select_candidate(&self.current_version, &versions) else {
            debug!("no eligible agent version above {}", self.current_version);
            return Ok(None);
        };
        if self.last_failed.as_ref() == Some(&candidate.version) {
            warn!(version = %candidate.version, "skipping candidate that failed the previous attempt");
            return Ok(None);
        }

        info!(
            from = %self.current_version,
            to = %candidate.version,
            "agent update candidate selected"
        );
        match self.download_and_install(candidate).await {
            Ok(pending) => Ok(Some(pending)),
            Err(e) => {
                self.last_failed = Some(candidate.version.clone());
                Err(e)
            }
        }
    }

    async fn download_and_install(
        &self,
        candidate: &AgentVersion,
    ) -> Result<PendingUpdate, UpdateError> {
        let install_dir = self.store.agent_dir(&candidate.version.to_string());
        tokio::fs::create_dir_all(&install_dir).await?;
        let package_path = install_dir.join("package.zip");

        self.wire
            .download_file(&candidate.location, &package_path)
            .await?;

        // Verify before anything is extracted; a bad package must never
        // replace running binaries even partially
        if let Err(e) = verify_checksum(&package_path, &candidate.checksum) {
            let _ = tokio::fs::remove_file(&package_path).await;
            let _ = tokio::fs::remove_dir_all(&install_dir).await;
            return Err(e);
        }

        let output = Command::new("unzip")
            .arg("-o")
            .arg(&package_path)
            .arg("-d")
            .arg(&install_dir)
            .output()
            .await
            .map_err(|e| UpdateError::Extract(format!("failed to run unzip: {}", e)))?;
        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&install_dir).await;
            return Err(UpdateError::Extract(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        tokio::fs::remove_file(&package_path).await?;

        Ok(PendingUpdate {
            version: candidate.version.clone(),
            install_dir,
        })
    }
}

/// Highest enabled version strictly greater than the running one.
/// Downgrades are never selected.
pub fn select_candidate<'a>(
    current: &Version,
    versions: &'a [AgentVersion],
) -> Option<&'a AgentVersion> {
    versions
        .iter()
        .filter(|v| v.enabled && v.version > *current)
        .max_by(|a, b| a.version.cmp(&b.version))
}

/// Compare the package's sha256 digest against the manifest value.
pub fn verify_checksum(path: &std::path::Path, expected: &str) -> Result<(), UpdateError> {
    let bytes = std::fs::read(path)?;
    let actual = hex_digest(&bytes);
    if expected.is_empty() || !actual.eq_ignore_ascii_case(expected) {
        return Err(UpdateError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn version(v: &str, enabled: bool) -> AgentVersion {
        AgentVersion {
            version: Version::parse(v).unwrap(),
            location: format!("http://host/agent-{}.zip", v),
            checksum: "abc".to_string(),
            enabled,
        }
    }

    #[test]
    fn selects_highest_enabled_version_above_current() {
        let current = Version::parse("1.2.0").unwrap();
        let versions = vec![
            version("1.1.0", true),
            version("1.3.0", true),
            version("2.0.0", false),
            version("1.4.0", true),
        ];
        let selected = select_candidate(&current, &versions).unwrap();
        assert_eq!(selected.version, Version::parse("1.4.0").unwrap());
    }

    #[test]
    fn never_selects_a_downgrade_or_equal_version() {
        let current = Version::parse("2.0.0").unwrap();
        let versions = vec![version("1.9.0", true), version("2.0.0", true)];
        assert!(select_candidate(&current, &versions).is_none());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.zip");
        std::fs::write(&path, b"agent package bytes").unwrap();

        let good = hex_digest(b"agent package bytes");
        assert!(verify_checksum(&path, &good).is_ok());
        assert!(verify_checksum(&path, &good.to_uppercase()).is_ok());

        let err = verify_checksum(&path, "deadbeef").unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumMismatch { .. }));
    }

    #[test]
    fn missing_manifest_checksum_fails_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.zip");
        std::fs::write(&path, b"bytes").unwrap();
        assert!(verify_checksum(&path, "").is_err());
    }

    #[test]
    fn parses_agent_manifest_document() {
        let xml = r#"
            <AgentManifest>
              <Family>
                <Name>Prod</Name>
                <Package version="1.3.0" uri="http://host/agent-1.3.0.zip" sha256="aa" enabled="true"/>
                <Package version="1.4.0" uri="http://host/agent-1.4.0.zip" sha256="bb" enabled="false"/>
              </Family>
              <Family>
                <Name>Test</Name>
                <Package version="9.9.9" uri="http://host/agent-9.9.9.zip" sha256="cc"/>
              </Family>
            </AgentManifest>"#;
        let doc: AgentManifestDocument = quick_xml::de::from_str(xml).unwrap();

        let prod = doc.versions_for_family("Prod");
        assert_eq!(prod.len(), 2);
        assert_eq!(prod[0].version, Version::parse("1.3.0").unwrap());
        assert!(!prod[1].enabled);
        // Channel filter excludes other families
        assert_eq!(doc.versions_for_family("Test").len(), 1);
        assert!(doc.versions_for_family("Canary").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_throttled_by_the_interval_floor() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let wire = WireClient::new("http://127.0.0.1:1", "agent", "0.1.0");
        let mut coordinator = AutoUpdateCoordinator::new(
            wire,
            store,
            Version::parse("0.1.0").unwrap(),
            "Prod",
            "http://127.0.0.1:1/manifest",
        )
        .with_min_interval(Duration::from_secs(600));

        // Fake the outcome of a just-finished attempt
        coordinator.last_attempt = Some(Instant::now());

        // Well inside the floor window: no network attempt is made at all
        let result = coordinator.check_for_update().await.unwrap();
        assert!(result.is_none());
    }
}
