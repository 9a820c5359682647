mod constants;
mod settings;

pub use constants::*;
pub use settings::AgentSettings;
