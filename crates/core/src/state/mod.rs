//! State management for workflows.
//!
//! This module provides:
//! - Workflow state machine logic
//! - The workflow registry with per-workflow locks
//! - The Orchestrator coordinating multiple workflows

pub mod manager;
pub mod registry;
pub mod workflow;

pub use manager::Orchestrator;
pub use registry::{WorkflowEntry, WorkflowRegistry};
