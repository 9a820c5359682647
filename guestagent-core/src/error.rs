use std::path::PathBuf;

use thiserror::Error;

/// Errors from the goal state fetch path.
///
/// Transient variants are retried with backoff and deferred to the next poll
/// cycle; `MalformedGoalState` leaves the previous goal state authoritative.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to wireserver failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("wireserver returned HTTP {0}")]
    Status(u16),

    #[error("malformed goal state: {0}")]
    MalformedGoalState(String),
}

impl FetchError {
    /// Transient errors are worth retrying; malformed documents are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) => true,
            FetchError::Status(code) => *code >= 500,
            FetchError::MalformedGoalState(_) => false,
        }
    }
}

/// Errors from a single extension lifecycle operation. Always contained to
/// that extension's state record; never faults the primary loop.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("failed to download extension package: {0}")]
    Download(String),

    #[error("failed to extract extension package: {0}")]
    Extract(String),

    #[error("handler manifest invalid: {0}")]
    Manifest(String),

    #[error("handler has no command for {0}")]
    UnsupportedCommand(&'static str),

    #[error("failed to launch handler process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("operation exceeded wall-clock timeout of {0}s")]
    Timeout(u64),

    #[error("handler produced no status update within {0}s, treated as hung")]
    Hung(u64),

    #[error("operation cancelled by a superseding goal state")]
    Cancelled,

    #[error("handler exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("handler exited successfully but wrote no valid status artifact: {0}")]
    MissingStatus(String),

    #[error("i/o error during operation: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the status upload path.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status upload failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status endpoint returned HTTP {0}")]
    Status(u16),

    #[error("failed to serialize status document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to serialize report document: {0}")]
    Xml(String),
}

/// Errors from the auto-update path. None of these ever disturb the running
/// agent version.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to fetch agent manifest: {0}")]
    Manifest(String),

    #[error("failed to download agent package: {0}")]
    Download(String),

    #[error("package checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("failed to extract agent package: {0}")]
    Extract(String),

    #[error("i/o error during update: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the engine-owned local state store. `Corrupted` is fatal for
/// the affected record only and forces a re-bootstrap of that record.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("corrupted state file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("i/o error in state store: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level agent fault. Only raised for conditions that make the engine's
/// own bookkeeping untrustworthy.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("engine channel closed unexpectedly")]
    ChannelClosed,
}
