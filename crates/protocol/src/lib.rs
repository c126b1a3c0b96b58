//! # pf-protocol
//!
//! Core protocol definitions and data models for printflow.
//!
//! This crate defines all shared data structures used for:
//! - Workflow records (phases, steps, artifacts, errors)
//! - Printer profiles and connection snapshots
//! - Configuration file parsing (TOML settings, YAML profile overrides)
//! - Events broadcast by the core
//!
//! ## Modules
//!
//! - [`workflow_models`]: Workflow, steps, requests and artifacts
//! - [`printer_models`]: Printer profile, connection state and telemetry
//! - [`config_models`]: Settings from `.printflow/`
//! - [`ipc`]: Events emitted by the core
//!
//! ## Design Principles
//!
//! - Minimal dependencies: Only serde, ts-rs, uuid and chrono
//! - TypeScript generation: All types derive `TS` for client compatibility
//! - Independent compilation: No dependencies on other printflow crates

pub mod config_models;
pub mod ipc;
pub mod printer_models;
pub mod workflow_models;

// Re-export all public types for convenience
pub use config_models::*;
pub use ipc::*;
pub use printer_models::*;
pub use workflow_models::*;
