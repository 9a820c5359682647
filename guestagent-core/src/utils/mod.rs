pub mod timestamps;

pub use timestamps::*;

/// Get user agent string for the guest agent
pub fn get_user_agent(agent_name: &str, agent_version: &str) -> String {
    format!("{}/{}", agent_name, agent_version)
}
