//! Machine health document, posted with each report cycle so the platform
//! can distinguish a healthy agent from one that has lost its feed.

use serde::Serialize;

use crate::wireserver::goal_state::GoalState;

#[derive(Debug, Serialize)]
pub struct Health {
    #[serde(rename = "GoalStateIncarnation")]
    pub incarnation: u64,
    #[serde(rename = "Container")]
    pub container: HealthContainer,
}

#[derive(Debug, Serialize)]
pub struct HealthContainer {
    #[serde(rename = "ContainerId")]
    pub container_id: String,
    #[serde(rename = "RoleInstanceList")]
    pub role_instance_list: HealthRoleInstanceList,
}

#[derive(Debug, Serialize)]
pub struct HealthRoleInstanceList {
    #[serde(rename = "Role")]
    pub role: HealthRole,
}

#[derive(Debug, Serialize)]
pub struct HealthRole {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "Health")]
    pub health: HealthState,
}

#[derive(Debug, Serialize)]
pub struct HealthState {
    #[serde(rename = "State")]
    pub state: String,
}

/// `ready` reflects whether the last goal state fetch succeeded.
pub fn build_health(goal_state: &GoalState, ready: bool) -> Health {
    Health {
        incarnation: goal_state.incarnation,
        container: HealthContainer {
            container_id: goal_state.container_id.clone(),
            role_instance_list: HealthRoleInstanceList {
                role: HealthRole {
                    instance_id: goal_state.role_instance.clone(),
                    health: HealthState {
                        state: if ready { "Ready" } else { "NotReady" }.to_string(),
                    },
                },
            },
        },
    }
}
