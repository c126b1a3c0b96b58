//! Phase agent abstraction and registry.
//!
//! This module provides the `PhaseAgent` trait (Adapter Pattern) and
//! the `AgentRegistry` the orchestrator resolves phases through.

pub mod adapters;
pub mod base;
pub mod registry;

pub use adapters::{MockAgent, PrintAgent};
pub use base::{PhaseAgent, PhaseInput, ProgressReporter, TaskResult};
pub use registry::AgentRegistry;
