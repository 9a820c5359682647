//! Extension lifecycle: typed state, handler manifest adapters, package
//! installation, dependency-ordered sequencing, and isolated process
//! execution.

pub mod installer;
pub mod manifest;
pub mod runtime;
pub mod sequencer;
pub mod types;

pub use manifest::{HandlerAdapter, HandlerCommand};
pub use runtime::{ExtensionRuntime, OperationOutcome};
pub use sequencer::{build_plan, LevelBatch, OperationKind, Phase, PlannedOperation, TransitionPlan};
pub use types::*;
