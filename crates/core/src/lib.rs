//! # pf-core
//!
//! Core workflow orchestration and printer communication for printflow.
//!
//! This crate provides:
//! - Configuration loading from `.printflow/` directory
//! - Phase agent abstraction and adapter implementations
//! - Workflow execution engine with timeouts, cancellation and rollback
//! - State management for registered workflows
//! - Printer transport, firmware discovery, G-code streaming and telemetry
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and management
//! - [`agents`]: PhaseAgent trait and adapter implementations
//! - [`engine`]: Workflow execution engine and rollback
//! - [`state`]: Workflow records, registry and the Orchestrator
//! - [`printer`]: Printer communication layer
//! - [`cancel`]: Cooperative cancellation tokens

pub mod agents;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod printer;
pub mod state;

pub use cancel::CancelToken;
pub use error::{OrchestratorError, OrchestratorResult};
pub use state::Orchestrator;
