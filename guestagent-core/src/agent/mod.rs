//! The engine loop and its production wiring.

pub mod engine;
pub mod startup;

pub use engine::{Engine, EngineExit};
pub use startup::build_engine;

// Re-exported so the daemon shares the engine's cancellation type.
pub use tokio_util::sync::CancellationToken;
