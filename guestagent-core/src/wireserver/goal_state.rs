use serde::Deserialize;

use crate::error::FetchError;

/// WireServer GoalState document as fetched from the machine endpoint
#[derive(Debug, Deserialize, Clone)]
pub struct GoalStateDocument {
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Incarnation")]
    pub incarnation: u64,
    #[serde(rename = "Container")]
    pub container: Container,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Container {
    #[serde(rename = "ContainerId")]
    pub container_id: String,
    #[serde(rename = "RoleInstanceList")]
    pub role_instance_list: RoleInstanceList,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoleInstanceList {
    #[serde(rename = "RoleInstance")]
    pub role_instance: RoleInstance,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoleInstance {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "Configuration")]
    pub configuration: Configuration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Configuration {
    /// URL of the extensions configuration document for this incarnation
    #[serde(rename = "ExtensionsConfig", default)]
    pub extensions_config: String,
}

/// Extensions configuration document referenced from the goal state container
#[derive(Debug, Deserialize)]
pub struct ExtensionsConfigDocument {
    #[serde(rename = "Plugins", default)]
    pub plugins: Plugins,
    #[serde(rename = "PluginSettings", default)]
    pub plugin_settings: PluginSettings,
    /// Destination for the aggregate status document
    #[serde(rename = "StatusUploadBlob", default)]
    pub status_upload_blob: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Plugins {
    #[serde(rename = "Plugin", default)]
    pub plugin: Vec<PluginDefinition>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PluginSettings {
    #[serde(rename = "Plugin", default)]
    pub plugin: Vec<PluginRuntimeSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PluginDefinition {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@version")]
    pub version: String,
    /// Package manifest location
    #[serde(rename = "@location", default)]
    pub location: String,
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@dependencyLevel", default)]
    pub dependency_level: i32,
}

#[derive(Debug, Deserialize)]
pub struct PluginRuntimeSettings {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "RuntimeSettings")]
    pub runtime_settings: RuntimeSettingsElement,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeSettingsElement {
    #[serde(rename = "@seqNo")]
    pub seq_no: u64,
    #[serde(rename = "$value", default)]
    pub content: String,
}

/// Requested end state for an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedState {
    Enabled,
    Disabled,
    Uninstall,
}

impl RequestedState {
    fn parse(s: &str) -> Result<Self, FetchError> {
        match s {
            "enabled" => Ok(RequestedState::Enabled),
            "disabled" => Ok(RequestedState::Disabled),
            "uninstall" => Ok(RequestedState::Uninstall),
            other => Err(FetchError::MalformedGoalState(format!(
                "unknown requested state '{}'",
                other
            ))),
        }
    }
}

/// One extension's desired configuration within a goal state.
#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    pub name: String,
    pub version: String,
    /// Package manifest location
    pub location: String,
    pub requested_state: RequestedState,
    /// Settings payload handed to the handler process
    pub settings: Option<serde_json::Value>,
    /// Monotonically increasing per-extension settings sequence number
    pub sequence_number: u64,
    /// Lower levels run first on enable, reverse on disable
    pub dependency_level: i32,
}

/// Typed, immutable goal state model. Superseded, never mutated, by a goal
/// state with a strictly higher incarnation.
#[derive(Debug, Clone)]
pub struct GoalState {
    pub incarnation: u64,
    pub container_id: String,
    pub role_instance: String,
    /// Destination for status uploads, taken from the extensions config
    pub status_destination: String,
    pub extensions: Vec<ExtensionConfig>,
}

impl GoalState {
    /// Combine the goal state and extensions configuration documents into the
    /// typed model consumed by the sequencer.
    pub fn from_documents(
        doc: &GoalStateDocument,
        ext_config: &ExtensionsConfigDocument,
    ) -> Result<Self, FetchError> {
        let mut extensions = Vec::with_capacity(ext_config.plugins.plugin.len());

        for plugin in &ext_config.plugins.plugin {
            let requested_state = RequestedState::parse(&plugin.state)?;

            let runtime = ext_config
                .plugin_settings
                .plugin
                .iter()
                .find(|s| s.name == plugin.name && s.version == plugin.version);

            let (settings, sequence_number) = match runtime {
                Some(rs) if !rs.runtime_settings.content.trim().is_empty() => {
                    let parsed = serde_json::from_str(&rs.runtime_settings.content).map_err(
                        |e| {
                            FetchError::MalformedGoalState(format!(
                                "settings for '{}' are not valid JSON: {}",
                                plugin.name, e
                            ))
                        },
                    )?;
                    (Some(parsed), rs.runtime_settings.seq_no)
                }
                Some(rs) => (None, rs.runtime_settings.seq_no),
                None => (None, 0),
            };

            extensions.push(ExtensionConfig {
                name: plugin.name.clone(),
                version: plugin.version.clone(),
                location: plugin.location.clone(),
                requested_state,
                settings,
                sequence_number,
                dependency_level: plugin.dependency_level,
            });
        }

        Ok(GoalState {
            incarnation: doc.incarnation,
            container_id: doc.container.container_id.clone(),
            role_instance: doc
                .container
                .role_instance_list
                .role_instance
                .instance_id
                .clone(),
            status_destination: ext_config.status_upload_blob.clone(),
            extensions,
        })
    }

    pub fn extension(&self, name: &str) -> Option<&ExtensionConfig> {
        self.extensions.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quick_xml::de::from_str;

    const GOAL_STATE_XML: &str = r#"
        <GoalState>
          <Version>2012-11-30</Version>
          <Incarnation>12</Incarnation>
          <Container>
            <ContainerId>c-5a7f</ContainerId>
            <RoleInstanceList>
              <RoleInstance>
                <InstanceId>vm-0</InstanceId>
                <Configuration>
                  <ExtensionsConfig>http://host/extensionsConfig</ExtensionsConfig>
                </Configuration>
              </RoleInstance>
            </RoleInstanceList>
          </Container>
        </GoalState>"#;

    const EXT_CONFIG_XML: &str = r#"
        <ExtensionsConfig>
          <Plugins>
            <Plugin name="CustomScript" version="2.1.0" location="http://host/cs/manifest.xml" state="enabled" dependencyLevel="0" />
            <Plugin name="Monitor" version="1.0.0" location="http://host/mon/manifest.xml" state="enabled" dependencyLevel="1" />
          </Plugins>
          <PluginSettings>
            <Plugin name="CustomScript" version="2.1.0">
              <RuntimeSettings seqNo="3">{"commandToExecute": "echo hi"}</RuntimeSettings>
            </Plugin>
          </PluginSettings>
          <StatusUploadBlob>http://host/status</StatusUploadBlob>
        </ExtensionsConfig>"#;

    #[test]
    fn parses_goal_state_document() {
        let doc: GoalStateDocument = from_str(GOAL_STATE_XML).unwrap();
        assert_eq!(doc.incarnation, 12);
        assert_eq!(doc.container.container_id, "c-5a7f");
        assert_eq!(
            doc.container.role_instance_list.role_instance.configuration.extensions_config,
            "http://host/extensionsConfig"
        );
    }

    #[test]
    fn builds_typed_model_from_documents() {
        let doc: GoalStateDocument = from_str(GOAL_STATE_XML).unwrap();
        let ext: ExtensionsConfigDocument = from_str(EXT_CONFIG_XML).unwrap();
        let gs = GoalState::from_documents(&doc, &ext).unwrap();

        assert_eq!(gs.incarnation, 12);
        assert_eq!(gs.status_destination, "http://host/status");
        assert_eq!(gs.extensions.len(), 2);

        let cs = gs.extension("CustomScript").unwrap();
        assert_eq!(cs.requested_state, RequestedState::Enabled);
        assert_eq!(cs.sequence_number, 3);
        assert_eq!(cs.dependency_level, 0);
        assert_eq!(
            cs.settings.as_ref().unwrap()["commandToExecute"],
            "echo hi"
        );

        // No runtime settings published for Monitor
        let mon = gs.extension("Monitor").unwrap();
        assert_eq!(mon.sequence_number, 0);
        assert!(mon.settings.is_none());
        assert_eq!(mon.dependency_level, 1);
    }

    #[test]
    fn unknown_requested_state_is_malformed() {
        let doc: GoalStateDocument = from_str(GOAL_STATE_XML).unwrap();
        let xml = EXT_CONFIG_XML.replace("state=\"enabled\"", "state=\"paused\"");
        let ext: ExtensionsConfigDocument = from_str(&xml).unwrap();
        let err = GoalState::from_documents(&doc, &ext).unwrap_err();
        assert!(matches!(err, FetchError::MalformedGoalState(_)));
    }

    #[test]
    fn invalid_settings_json_is_malformed() {
        let doc: GoalStateDocument = from_str(GOAL_STATE_XML).unwrap();
        let xml = EXT_CONFIG_XML.replace(
            r#"{"commandToExecute": "echo hi"}"#,
            "not json at all",
        );
        let ext: ExtensionsConfigDocument = from_str(&xml).unwrap();
        let err = GoalState::from_documents(&doc, &ext).unwrap_err();
        assert!(matches!(err, FetchError::MalformedGoalState(_)));
    }
}
