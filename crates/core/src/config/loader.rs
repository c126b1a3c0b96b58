//! Configuration file loader for `.printflow/` directory structure.
//!
//! This module provides functionality to load and parse all configuration files
//! from the `.printflow/` directory, including:
//! - `config.toml`: Global settings
//! - `profiles/*.yaml`: Printer profile overrides

use crate::config::error::ConfigError;
use crate::config::error::ConfigResult;
use crate::config::models::AppConfig;
use pf_protocol::config_models::{GlobalConfig, ProfileOverride};
use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

/// Name of the configuration directory under the project root.
pub const CONFIG_DIR: &str = ".printflow";

/// Loads all configuration from the `.printflow/` directory.
///
/// # Arguments
///
/// * `root` - Root directory containing the `.printflow/` folder
///
/// # Returns
///
/// An `AppConfig` containing all loaded configuration. Missing directories
/// or files yield defaults rather than an error.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - Files exist but cannot be read
/// - Files have invalid syntax (TOML or YAML)
/// - Values are out of range (zero timeouts, zero baud rate) or two
///   profile overrides share a name
///
/// # Example
///
/// ```rust,no_run
/// use pf_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Loaded {} profile overrides", config.profiles.len());
/// # Ok(())
/// # }
/// ```
pub async fn load_config(root: &Path) -> ConfigResult<AppConfig> {
    let pf_dir = root.join(CONFIG_DIR);

    if !pf_dir.exists() {
        return Ok(AppConfig::default());
    }

    let global = load_global_config(&pf_dir)?;
    let profiles = load_profiles(&pf_dir)?;

    Ok(AppConfig { global, profiles })
}

/// Loads global configuration from `config.toml`.
fn load_global_config(pf_dir: &Path) -> ConfigResult<GlobalConfig> {
    let config_path = pf_dir.join("config.toml");

    if !config_path.exists() {
        return Ok(GlobalConfig::default());
    }

    let content =
        std::fs::read_to_string(&config_path).map_err(|source| ConfigError::FileRead {
            path: config_path.clone(),
            source,
        })?;

    let config: GlobalConfig =
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: config_path.clone(),
            source,
        })?;

    if let Some((key, reason)) = out_of_range(&config) {
        return Err(ConfigError::InvalidSetting {
            path: config_path,
            key,
            reason,
        });
    }

    Ok(config)
}

/// The first setting that would stall or spin the communicator.
fn out_of_range(config: &GlobalConfig) -> Option<(&'static str, &'static str)> {
    let printer = &config.printer;
    [
        ("printer.baud_rate", u64::from(printer.baud_rate)),
        ("printer.ack_timeout_ms", printer.ack_timeout_ms),
        ("printer.telemetry_interval_ms", printer.telemetry_interval_ms),
        ("printer.connect_timeout_ms", printer.connect_timeout_ms),
        (
            "discovery.per_endpoint_timeout_ms",
            config.discovery.per_endpoint_timeout_ms,
        ),
    ]
    .into_iter()
    .find(|(_, value)| *value == 0)
    .map(|(key, _)| (key, "must be positive"))
}

/// Loads all profile overrides from `profiles/*.yaml`.
fn load_profiles(pf_dir: &Path) -> ConfigResult<Vec<ProfileOverride>> {
    let profiles_dir = pf_dir.join("profiles");

    if !profiles_dir.exists() {
        return Ok(Vec::new());
    }

    let mut profiles = Vec::new();
    let mut names = HashSet::new();

    for entry in WalkDir::new(&profiles_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| ConfigError::ProfileScan {
            path: profiles_dir.clone(),
            source,
        })?;

        let path = entry.path();

        let ext = path.extension().and_then(|s| s.to_str());
        if ext != Some("yaml") && ext != Some("yml") {
            continue;
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let profile: ProfileOverride =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ProfileParse {
                path: path.to_path_buf(),
                source,
            })?;

        if !names.insert(profile.name.clone()) {
            return Err(ConfigError::DuplicateProfile {
                path: path.to_path_buf(),
                name: profile.name,
            });
        }

        profiles.push(profile);
    }

    Ok(profiles)
}
