use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use quick_xml::de::from_str;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::{
    FETCH_BACKOFF_BASE, FETCH_BACKOFF_CAP, HTTP_REQUEST_TIMEOUT, DOWNLOAD_TIMEOUT,
    MAX_FETCH_ATTEMPTS, WIRESERVER_API_VERSION, STATUS_API_VERSION,
};
use crate::error::{ExtensionError, FetchError, StatusError, UpdateError};
use crate::update::{AgentManifestDocument, AgentVersion};
use crate::utils::{get_timestamp, get_user_agent};
use crate::wireserver::goal_state::{ExtensionsConfigDocument, GoalState, GoalStateDocument};
use crate::wireserver::health::Health;
use crate::wireserver::telemetry::{TelemetryData, TelemetrySink};

/// Outcome of one poll of the goal state endpoint.
#[derive(Debug)]
pub enum PollOutcome {
    /// Published incarnation is not strictly greater than the last applied one
    NoChange,
    Updated(GoalState),
}

/// Source of goal states for the engine loop. The wire client is the
/// production implementation; tests substitute scripted sources.
#[async_trait]
pub trait GoalStateSource: Send + Sync {
    async fn poll(&self, last_incarnation: u64) -> Result<PollOutcome, FetchError>;
}

/// Destination for serialized status documents.
#[async_trait]
pub trait StatusUploader: Send + Sync {
    async fn upload(&self, destination: &str, status_json: &str) -> Result<(), StatusError>;
}

/// Downloads extension packages referenced from a goal state.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    async fn fetch_package(&self, location: &str, dest: &Path) -> Result<(), ExtensionError>;
}

/// HTTP client for the WireServer protocol.
#[derive(Debug, Clone)]
pub struct WireClient {
    client: Client,
    endpoint: String,
    agent_name: String,
    agent_version: String,
}

impl WireClient {
    pub fn new(endpoint: &str, agent_name: &str, agent_version: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
            agent_name: agent_name.to_string(),
            agent_version: agent_version.to_string(),
        }
    }

    async fn get_with_retry(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let mut delay = FETCH_BACKOFF_BASE;
        let mut attempt = 1;

        loop {
            match self.get_once(url, timeout).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < MAX_FETCH_ATTEMPTS => {
                    warn!(url, attempt, ?delay, "transient fetch failure, backing off: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(FETCH_BACKOFF_CAP);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header("x-ms-version", WIRESERVER_API_VERSION)
            .header("x-ms-agent-name", &self.agent_name)
            .header(
                "User-Agent",
                get_user_agent(&self.agent_name, &self.agent_version),
            )
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }

    /// Fetch the agent family manifest used by the auto-update coordinator.
    pub async fn fetch_agent_manifest(
        &self,
        manifest_url: &str,
        family: &str,
    ) -> Result<Vec<AgentVersion>, UpdateError> {
        let xml = self
            .get_with_retry(manifest_url, HTTP_REQUEST_TIMEOUT)
            .await
            .map_err(|e| UpdateError::Manifest(e.to_string()))?;

        let doc: AgentManifestDocument =
            from_str(&xml).map_err(|e| UpdateError::Manifest(e.to_string()))?;
        Ok(doc.versions_for_family(family))
    }

    /// Download a raw file (agent package) to `dest`.
    pub async fn download_file(&self, url: &str, dest: &Path) -> Result<(), UpdateError> {
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpdateError::Download(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    async fn post_xml(&self, url: &str, body: String) -> Result<(), StatusError> {
        let response = self
            .client
            .post(url)
            .header("x-ms-version", WIRESERVER_API_VERSION)
            .header("x-ms-agent-name", &self.agent_name)
            .header(
                "User-Agent",
                get_user_agent(&self.agent_name, &self.agent_version),
            )
            .header("Content-Type", "text/xml;charset=utf-8")
            .timeout(HTTP_REQUEST_TIMEOUT)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StatusError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Extract the package URI from a download manifest
pub fn extract_package_uri(manifest_xml: &str) -> Option<String> {
    let uri_pattern = regex::Regex::new(r"<Uri>([^<]+)</Uri>").ok()?;
    uri_pattern
        .captures(manifest_xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[async_trait]
impl GoalStateSource for WireClient {
    async fn poll(&self, last_incarnation: u64) -> Result<PollOutcome, FetchError> {
        let url = format!("{}/machine?comp=goalstate", self.endpoint);
        let xml = self.get_with_retry(&url, HTTP_REQUEST_TIMEOUT).await?;

        let doc: GoalStateDocument =
            from_str(&xml).map_err(|e| FetchError::MalformedGoalState(e.to_string()))?;

        if doc.incarnation <= last_incarnation {
            return Ok(PollOutcome::NoChange);
        }
        debug!(
            incarnation = doc.incarnation,
            last_incarnation, "goal state incarnation changed"
        );

        let ext_url = &doc
            .container
            .role_instance_list
            .role_instance
            .configuration
            .extensions_config;

        let ext_config = if ext_url.is_empty() {
            ExtensionsConfigDocument {
                plugins: Default::default(),
                plugin_settings: Default::default(),
                status_upload_blob: String::new(),
            }
        } else {
            let ext_xml = self.get_with_retry(ext_url, HTTP_REQUEST_TIMEOUT).await?;
            from_str(&ext_xml).map_err(|e| FetchError::MalformedGoalState(e.to_string()))?
        };

        let goal_state = GoalState::from_documents(&doc, &ext_config)?;
        Ok(PollOutcome::Updated(goal_state))
    }
}

#[async_trait]
impl StatusUploader for WireClient {
    async fn upload(&self, destination: &str, status_json: &str) -> Result<(), StatusError> {
        let content_b64 = BASE64_STANDARD.encode(status_json.as_bytes());
        let payload = serde_json::json!({
            "content": content_b64,
            "headers": [
                {"headerName": "x-ms-date", "headerValue": get_timestamp()},
                {"headerName": "x-ms-version", "headerValue": STATUS_API_VERSION}
            ],
            "requestUri": destination
        });

        let response = self
            .client
            .put(destination)
            .header("x-ms-version", STATUS_API_VERSION)
            .header("x-ms-agent-name", &self.agent_name)
            .header(
                "User-Agent",
                get_user_agent(&self.agent_name, &self.agent_version),
            )
            .header("Content-Type", "application/json")
            .timeout(HTTP_REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StatusError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for WireClient {
    async fn send_event(&self, event: &TelemetryData) -> Result<(), StatusError> {
        let xml =
            quick_xml::se::to_string(event).map_err(|e| StatusError::Xml(e.to_string()))?;
        let url = format!("{}/machine?comp=telemetrydata", self.endpoint);
        self.post_xml(&url, xml).await
    }

    async fn send_health(&self, health: &Health) -> Result<(), StatusError> {
        let xml =
            quick_xml::se::to_string(health).map_err(|e| StatusError::Xml(e.to_string()))?;
        let url = format!("{}/machine?comp=health", self.endpoint);
        self.post_xml(&url, xml).await
    }
}

#[async_trait]
impl PackageFetcher for WireClient {
    /// Resolve a package manifest to its payload URI and download the package.
    async fn fetch_package(&self, location: &str, dest: &Path) -> Result<(), ExtensionError> {
        let manifest_xml = self
            .get_with_retry(location, HTTP_REQUEST_TIMEOUT)
            .await
            .map_err(|e| ExtensionError::Download(e.to_string()))?;

        let package_uri = extract_package_uri(&manifest_xml)
            .ok_or_else(|| ExtensionError::Download("no <Uri> in package manifest".into()))?;
        debug!(package_uri, "resolved extension package uri");

        let response = self
            .client
            .get(&package_uri)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| ExtensionError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExtensionError::Download(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExtensionError::Download(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_uri_from_package_manifest() {
        let xml = r#"
            <PluginVersionManifest>
              <Version>1.0.0</Version>
              <Uri>http://host/packages/ext-1.0.0.zip</Uri>
            </PluginVersionManifest>"#;
        assert_eq!(
            extract_package_uri(xml).as_deref(),
            Some("http://host/packages/ext-1.0.0.zip")
        );
        assert_eq!(extract_package_uri("<Empty/>"), None);
    }
}
