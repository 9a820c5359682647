//! Engine-owned persisted local state.
//!
//! Stores the last applied incarnation, per-extension last-applied sequence
//! numbers, and the per-extension-version installation directories. Extensions
//! never write here except for the status artifacts the engine reads back.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PersistError;

const CHECKPOINT_FILE: &str = "goal_state.checkpoint";
const MRSEQ_DIR: &str = "mrseq";
const HANDLERS_DIR: &str = "handlers";
const AGENTS_DIR: &str = "agents";

/// Continuity checkpoint handed to a replacement agent version. The new
/// process resumes polling from `incarnation`, so no goal state is skipped or
/// reprocessed across a handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub incarnation: u64,
    pub agent_version: String,
    pub timestamp: String,
}

/// Filesystem layout under the agent's lib directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn open(root: &Path) -> Result<Self, PersistError> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join(MRSEQ_DIR))?;
        fs::create_dir_all(root.join(HANDLERS_DIR))?;
        fs::create_dir_all(root.join(AGENTS_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-extension-version installation directory.
    pub fn handler_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root
            .join(HANDLERS_DIR)
            .join(format!("{}-{}", name, version))
    }

    /// Version-isolated install location for a downloaded agent package.
    pub fn agent_dir(&self, version: &str) -> PathBuf {
        self.root.join(AGENTS_DIR).join(version)
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>, PersistError> {
        let path = self.root.join(CHECKPOINT_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = serde_json::from_str(&raw).map_err(|e| PersistError::Corrupted {
            path,
            reason: e.to_string(),
        })?;
        Ok(Some(checkpoint))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistError> {
        let path = self.root.join(CHECKPOINT_FILE);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(checkpoint).map_err(|e| {
            PersistError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Last applied settings sequence number for an extension, if any.
    /// A corrupted record is treated as absent after re-bootstrapping it.
    pub fn read_mrseq(&self, name: &str) -> Option<u64> {
        let path = self.root.join(MRSEQ_DIR).join(name);
        let raw = fs::read_to_string(&path).ok()?;
        match raw.trim().parse() {
            Ok(seq) => Some(seq),
            Err(_) => {
                warn!(extension = name, "corrupted mrseq record, re-bootstrapping");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    pub fn write_mrseq(&self, name: &str, seq_no: u64) -> Result<(), PersistError> {
        let path = self.root.join(MRSEQ_DIR).join(name);
        fs::write(&path, seq_no.to_string())?;
        Ok(())
    }

    /// Remove an extension's installation directory and sequence record once
    /// it has reached `Removed`.
    pub fn remove_handler(&self, name: &str, version: &str) -> Result<(), PersistError> {
        let dir = self.handler_dir(name, version);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let mrseq = self.root.join(MRSEQ_DIR).join(name);
        if mrseq.exists() {
            fs::remove_file(&mrseq)?;
        }
        Ok(())
    }
}
