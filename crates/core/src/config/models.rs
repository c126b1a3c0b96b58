//! Configuration models that aggregate all settings.
//!
//! This module provides the unified `AppConfig` structure that combines
//! global settings and printer profile overrides into a single
//! configuration object.

use crate::printer::profile::ProfileTable;
use pf_protocol::config_models::{GlobalConfig, ProfileOverride};

/// Unified application configuration loaded from `.printflow/` directory.
///
/// This structure aggregates all configuration sources:
/// - `config.toml`: Orchestrator, printer and discovery settings
/// - `profiles/*.yaml`: Printer profile overrides
///
/// # Example
///
/// ```rust,no_run
/// use pf_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Ack timeout: {} ms, {} profile override(s)",
///          config.global.printer.ack_timeout_ms,
///          config.profiles.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// Global settings from `config.toml`.
    pub global: GlobalConfig,

    /// Profile overrides loaded from `profiles/*.yaml`, sorted by file name.
    pub profiles: Vec<ProfileOverride>,
}

impl AppConfig {
    /// The capability table with this configuration's overrides applied.
    pub fn profile_table(&self) -> ProfileTable {
        ProfileTable::with_overrides(self.profiles.clone())
    }
}
