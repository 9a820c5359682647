//! Goal state processing and extension lifecycle engine.
//!
//! The engine polls the platform for goal state changes, sequences extension
//! lifecycle operations by dependency level, executes them as isolated child
//! processes, aggregates status for upload, and coordinates agent self-update.

pub mod agent;
pub mod cgroups;
pub mod config;
pub mod error;
pub mod extensions;
pub mod persist;
pub mod status;
pub mod update;
pub mod utils;
pub mod wireserver;
