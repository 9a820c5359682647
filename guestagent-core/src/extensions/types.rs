use serde::{Deserialize, Serialize};

/// Lifecycle states for one extension instance. `Failed` is non-terminal with
/// respect to goal states: a later incarnation may re-attempt any target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerState {
    NotInstalled,
    Downloading,
    Installing,
    Enabling,
    Enabled,
    Disabling,
    Disabled,
    Uninstalling,
    Removed,
    Failed,
}

impl HandlerState {
    /// Terminal with respect to the current transition plan; the next
    /// dependency level may start once every extension at this level is
    /// terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandlerState::Enabled
                | HandlerState::Disabled
                | HandlerState::Removed
                | HandlerState::Failed
                | HandlerState::NotInstalled
        )
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, HandlerState::NotInstalled | HandlerState::Removed)
    }
}

/// Severity reported by a handler in its status artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Transitioning,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedMessage {
    pub lang: String,
    pub message: String,
}

impl FormattedMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            lang: "en-US".to_string(),
            message: message.into(),
        }
    }
}

/// Structured status artifact a handler writes at
/// `status/<seq>.status` after an enable operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusArtifact {
    pub status: StatusLevel,
    pub code: i32,
    #[serde(rename = "formattedMessage")]
    pub formatted_message: FormattedMessage,
}

/// Last known status of one extension, as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionStatus {
    pub status: StatusLevel,
    pub code: i32,
    pub message: String,
    pub sequence_number: u64,
}

impl ExtensionStatus {
    pub fn from_artifact(artifact: StatusArtifact, sequence_number: u64) -> Self {
        Self {
            status: artifact.status,
            code: artifact.code,
            message: artifact.formatted_message.message,
            sequence_number,
        }
    }
}

/// Per-extension-name record owned exclusively by the engine loop.
/// Extensions never mutate this; they only write status artifacts the engine
/// reads back.
#[derive(Debug, Clone)]
pub struct ExtensionRuntimeState {
    pub version: String,
    pub state: HandlerState,
    pub last_sequence: Option<u64>,
    pub retry_count: u32,
    /// Learned from the handler manifest when the adapter is first resolved
    pub supports_update: bool,
    pub last_status: Option<ExtensionStatus>,
    pub last_error: Option<String>,
}

impl ExtensionRuntimeState {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            state: HandlerState::NotInstalled,
            last_sequence: None,
            retry_count: 0,
            supports_update: false,
            last_status: None,
            last_error: None,
        }
    }
}
