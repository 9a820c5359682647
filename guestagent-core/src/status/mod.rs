//! Status aggregation and upload.
//!
//! One `StatusDocument` is built per reporting interval from the agent-level
//! state and every extension runtime-state record, then uploaded to the
//! destination referenced by the current goal state. Uploads are debounced on
//! content and retried with backoff on failure.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MAX_UPLOAD_ATTEMPTS;
use crate::error::StatusError;
use crate::extensions::types::{ExtensionRuntimeState, HandlerState};
use crate::utils::get_rfc3339_timestamp;
use crate::wireserver::StatusUploader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionStatusReport {
    pub state: HandlerState,
    pub code: i32,
    pub message: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
}

/// The sole value the status reporter uploads.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(rename = "agentVersion")]
    pub agent_version: String,
    pub incarnation: u64,
    #[serde(rename = "agentStatus")]
    pub agent_status: String,
    #[serde(rename = "agentMessage")]
    pub agent_message: String,
    #[serde(rename = "timestampUTC")]
    pub timestamp: String,
    pub extensions: BTreeMap<String, ExtensionStatusReport>,
}

impl StatusDocument {
    /// Content identity used for upload debouncing. The timestamp is excluded
    /// so that an unchanged machine state produces an identical fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut copy = self.clone();
        copy.timestamp = String::new();
        serde_json::to_string(&copy).unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String, StatusError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build the aggregate document from the engine's state records.
pub fn build_document(
    agent_name: &str,
    agent_version: &str,
    incarnation: u64,
    fetch_error: Option<&str>,
    states: &HashMap<String, ExtensionRuntimeState>,
) -> StatusDocument {
    let extensions = states
        .iter()
        .map(|(name, rs)| {
            let (code, message) = match (&rs.last_status, &rs.last_error) {
                (_, Some(error)) => (-1, error.clone()),
                (Some(status), None) => (status.code, status.message.clone()),
                (None, None) => (0, String::new()),
            };
            (
                name.clone(),
                ExtensionStatusReport {
                    state: rs.state,
                    code,
                    message,
                    sequence_number: rs.last_sequence.unwrap_or(0),
                },
            )
        })
        .collect();

    let (agent_status, agent_message) = match fetch_error {
        Some(e) => ("NotReady".to_string(), e.to_string()),
        None => ("Ready".to_string(), "Guest agent is running".to_string()),
    };

    StatusDocument {
        agent_name: agent_name.to_string(),
        agent_version: agent_version.to_string(),
        incarnation,
        agent_status,
        agent_message,
        timestamp: get_rfc3339_timestamp(),
        extensions,
    }
}

/// Debounced, retrying status uploader.
pub struct StatusReporter<U: StatusUploader> {
    uploader: U,
    /// Fingerprint of the last successfully uploaded document
    last_uploaded: Option<String>,
}

impl<U: StatusUploader> StatusReporter<U> {
    pub fn new(uploader: U) -> Self {
        Self {
            uploader,
            last_uploaded: None,
        }
    }

    /// Upload the document unless it is content-identical to the last
    /// successful upload. Returns `Ok(false)` when debounced.
    ///
    /// On exhaustion of the retry budget the cached baseline is kept, so the
    /// same document is attempted again on the next cycle.
    pub async fn report(
        &mut self,
        document: &StatusDocument,
        destination: &str,
    ) -> Result<bool, StatusError> {
        if destination.is_empty() {
            return Ok(false);
        }

        let fingerprint = document.fingerprint();
        if self.last_uploaded.as_deref() == Some(fingerprint.as_str()) {
            debug!("status unchanged since last upload, skipping");
            return Ok(false);
        }

        let json = document.to_json()?;
        let mut delay = Duration::from_secs(1);
        let mut attempt = 1;
        loop {
            match self.uploader.upload(destination, &json).await {
                Ok(()) => {
                    self.last_uploaded = Some(fingerprint);
                    return Ok(true);
                }
                Err(e) if attempt < MAX_UPLOAD_ATTEMPTS => {
                    warn!(attempt, "status upload failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("status upload failed after {attempt} attempts: {e}");
                    return Err(e);
                }
            }
        }
    }
}
