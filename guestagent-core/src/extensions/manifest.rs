use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ExtensionError;

pub const HANDLER_MANIFEST_FILE: &str = "HandlerManifest.json";

/// Handler lifecycle command verbs, keyed by capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerCommand {
    Install,
    Enable,
    Disable,
    Update,
    Uninstall,
}

impl HandlerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerCommand::Install => "install",
            HandlerCommand::Enable => "enable",
            HandlerCommand::Disable => "disable",
            HandlerCommand::Update => "update",
            HandlerCommand::Uninstall => "uninstall",
        }
    }
}

/// On-disk `HandlerManifest.json` entry. The file holds a one-element array.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "handlerManifest")]
    handler_manifest: ManifestCommands,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestCommands {
    install_command: String,
    enable_command: String,
    disable_command: String,
    uninstall_command: String,
    #[serde(default)]
    update_command: Option<String>,
}

/// Commands for one handler version, resolved once from its manifest at load
/// time rather than per call.
#[derive(Debug, Clone)]
pub struct HandlerAdapter {
    commands: HashMap<HandlerCommand, String>,
}

impl HandlerAdapter {
    /// Load and resolve the manifest from an installed handler directory.
    pub fn load(handler_dir: &Path) -> Result<Self, ExtensionError> {
        let path = handler_dir.join(HANDLER_MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ExtensionError::Manifest(format!("{}: {}", path.display(), e)))?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&raw)
            .map_err(|e| ExtensionError::Manifest(format!("{}: {}", path.display(), e)))?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| ExtensionError::Manifest("empty handler manifest".into()))?;

        let m = entry.handler_manifest;
        let mut commands = HashMap::from([
            (HandlerCommand::Install, m.install_command),
            (HandlerCommand::Enable, m.enable_command),
            (HandlerCommand::Disable, m.disable_command),
            (HandlerCommand::Uninstall, m.uninstall_command),
        ]);
        if let Some(update) = m.update_command {
            commands.insert(HandlerCommand::Update, update);
        }

        Ok(Self { commands })
    }

    pub fn command(&self, verb: HandlerCommand) -> Result<&str, ExtensionError> {
        self.commands
            .get(&verb)
            .map(String::as_str)
            .ok_or(ExtensionError::UnsupportedCommand(verb.as_str()))
    }

    /// Whether the handler declares in-place update capability.
    pub fn supports_update(&self) -> bool {
        self.commands.contains_key(&HandlerCommand::Update)
    }
}
