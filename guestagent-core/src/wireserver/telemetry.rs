//! Telemetry events posted to the platform endpoint as XML.
//!
//! Events ride the same wire channel as status reports but are strictly
//! best-effort: a failed send is logged and dropped, never retried across
//! cycles and never allowed to disturb the engine loop.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StatusError;
use crate::utils::get_timestamp;
use crate::wireserver::goal_state::GoalState;
use crate::wireserver::health::Health;

/// Root telemetry document. Element and attribute casing follow the platform
/// schema; the struct name is the root element name.
#[derive(Debug, Serialize)]
pub struct TelemetryData {
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "Provider")]
    pub provider: Provider,
}

#[derive(Debug, Serialize)]
pub struct Provider {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "Event")]
    pub event: Event,
}

#[derive(Debug, Serialize)]
pub struct Event {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "EventData")]
    pub event_data: EventData,
}

#[derive(Debug, Serialize)]
pub struct EventData {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "Param")]
    pub params: Vec<Param>,
}

#[derive(Debug, Serialize)]
pub struct Param {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@value")]
    pub value: String,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Event types the agent emits, with their wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Periodic liveness signal
    HeartBeat,
    /// Summary of the agent's view of extension state
    AgentStatus,
    /// Emitted once, when the first goal state is applied after start
    AgentStart,
}

impl EventKind {
    pub fn event_id(&self) -> &'static str {
        match self {
            EventKind::HeartBeat => "1",
            EventKind::AgentStatus => "2",
            EventKind::AgentStart => "3",
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            EventKind::HeartBeat => "HeartBeat",
            EventKind::AgentStatus => "AgentStatus",
            EventKind::AgentStart => "AgentStart",
        }
    }
}

/// Build one event against the currently applied goal state.
pub fn build_event(
    kind: EventKind,
    goal_state: &GoalState,
    agent_name: &str,
    agent_version: &str,
) -> TelemetryData {
    let params = vec![
        Param::new("Version", agent_version),
        Param::new("Timestamp", get_timestamp()),
        Param::new("Container", &goal_state.container_id),
        Param::new("RoleInstance", &goal_state.role_instance),
        Param::new("Incarnation", goal_state.incarnation.to_string()),
    ];
    TelemetryData {
        version: "1.0".to_string(),
        provider: Provider {
            id: agent_name.to_string(),
            event: Event {
                id: kind.event_id().to_string(),
                event_data: EventData {
                    name: kind.event_name().to_string(),
                    params,
                },
            },
        },
    }
}

/// Best-effort sink for telemetry events and machine health documents. The
/// wire client is the production implementation; tests substitute recorders.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send_event(&self, event: &TelemetryData) -> Result<(), StatusError>;
    async fn send_health(&self, health: &Health) -> Result<(), StatusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal_state() -> GoalState {
        GoalState {
            incarnation: 7,
            container_id: "c-1".into(),
            role_instance: "vm-0".into(),
            status_destination: String::new(),
            extensions: vec![],
        }
    }

    #[test]
    fn event_serializes_to_platform_schema() {
        let event = build_event(EventKind::HeartBeat, &goal_state(), "agent", "0.1.0");
        let xml = quick_xml::se::to_string(&event).unwrap();

        assert!(xml.starts_with(r#"<TelemetryData version="1.0">"#), "{xml}");
        assert!(xml.contains(r#"<Provider id="agent">"#), "{xml}");
        assert!(xml.contains(r#"<Event id="1">"#), "{xml}");
        assert!(xml.contains(r#"<EventData name="HeartBeat">"#), "{xml}");
        assert!(xml.contains(r#"name="Container" value="c-1""#), "{xml}");
        assert!(xml.contains(r#"name="Incarnation" value="7""#), "{xml}");
    }

    #[test]
    fn event_kinds_carry_distinct_wire_ids() {
        let ids: Vec<_> = [EventKind::HeartBeat, EventKind::AgentStatus, EventKind::AgentStart]
            .iter()
            .map(|k| k.event_id())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
