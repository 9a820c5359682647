//! WireServer protocol types and client.
//!
//! Data structures for the goal state and extensions configuration documents
//! published by the platform, and the HTTP client that fetches them, resolves
//! package locations, uploads status and posts telemetry.

pub mod goal_state;
pub mod health;
pub mod protocol;
pub mod telemetry;

pub use goal_state::*;
pub use health::*;
pub use protocol::*;
pub use telemetry::*;
