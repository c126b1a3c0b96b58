//! Errors raised while loading `.printflow/`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `config.toml` is not valid TOML or does not match the settings schema.
    #[error("Failed to parse settings in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A file under `profiles/` is not a valid profile override.
    #[error("Failed to parse printer profile {path}: {source}")]
    ProfileParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Failed to list printer profiles in {path}: {source}")]
    ProfileScan {
        path: PathBuf,
        source: walkdir::Error,
    },

    /// A timing or serial setting is out of range.
    #[error("Invalid setting {key} in {path}: {reason}")]
    InvalidSetting {
        path: PathBuf,
        key: &'static str,
        reason: &'static str,
    },

    /// Two override files declare the same profile name.
    #[error("Printer profile '{name}' in {path} is already defined")]
    DuplicateProfile { path: PathBuf, name: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
