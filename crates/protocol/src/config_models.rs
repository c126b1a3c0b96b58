//! Configuration models for `.printflow/config.toml` and `.printflow/profiles/*.yaml`.
//!
//! Every field has a default so that a missing or partial file still yields
//! a usable configuration.

use crate::printer_models::{BuildVolume, FirmwareDialect, ThermalPreset};
use crate::workflow_models::Phase;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use ts_rs::TS;

/// Represents global settings from `.printflow/config.toml`.
///
/// # Example
///
/// ```toml
/// # .printflow/config.toml
/// [orchestrator]
/// slicing_timeout_secs = 900
///
/// [printer]
/// port = "/dev/ttyUSB0"
/// baud_rate = 250000
/// max_retries = 5
///
/// [discovery]
/// candidate_ports = ["/dev/ttyUSB0", "/dev/ttyACM0"]
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, TS)]
#[serde(default)]
pub struct GlobalConfig {
    pub orchestrator: OrchestratorSettings,
    pub printer: PrinterSettings,
    pub discovery: DiscoverySettings,
}

/// Workflow orchestrator settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub research_timeout_secs: u64,
    pub cad_timeout_secs: u64,
    pub slicing_timeout_secs: u64,
    pub printing_timeout_secs: u64,

    /// Extra attempts granted to a phase that timed out.
    pub timeout_retries: u32,

    /// Root under which each workflow gets its own scratch directory.
    ///
    /// Defaults to `<system temp>/printflow`.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            research_timeout_secs: 120,
            cad_timeout_secs: 600,
            slicing_timeout_secs: 600,
            printing_timeout_secs: 86_400,
            timeout_retries: 0,
            scratch_dir: None,
        }
    }
}

impl OrchestratorSettings {
    /// The per-phase agent timeout.
    pub fn timeout_for(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Research => self.research_timeout_secs,
            Phase::Cad => self.cad_timeout_secs,
            Phase::Slicing => self.slicing_timeout_secs,
            Phase::Printing => self.printing_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// The directory under which workflow scratch directories are created.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("printflow"))
    }
}

/// Printer communicator settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct PrinterSettings {
    /// Serial device to use when none is given on the command line.
    pub port: Option<String>,
    pub baud_rate: u32,

    /// How long to wait for `ok` after each line.
    pub ack_timeout_ms: u64,

    /// Resends allowed per line before the stream is aborted.
    pub max_retries: u32,

    pub telemetry_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            ack_timeout_ms: 5_000,
            max_retries: 3,
            telemetry_interval_ms: 2_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl PrinterSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Device discovery settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Endpoints to probe. Empty means "every serial port the OS reports".
    pub candidate_ports: Vec<String>,
    pub per_endpoint_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            candidate_ports: Vec::new(),
            per_endpoint_timeout_ms: 2_000,
        }
    }
}

impl DiscoverySettings {
    pub fn per_endpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.per_endpoint_timeout_ms)
    }
}

/// Per-machine adjustments loaded from `.printflow/profiles/*.yaml`.
///
/// An override applies to a classified device when the dialect matches and
/// the device's vendor hint contains `vendor_match` (case-insensitive).
///
/// # Example
///
/// ```yaml
/// name: workshop-ender
/// dialect: MARLIN
/// vendor_match: ender-3
/// build_volume: { x: 235, y: 235, z: 250 }
/// thermal_presets:
///   - { name: PETG, hotend: 240, bed: 80 }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ProfileOverride {
    pub name: String,
    pub dialect: FirmwareDialect,
    #[serde(default)]
    pub vendor_match: Option<String>,
    #[serde(default)]
    pub build_volume: Option<BuildVolume>,
    #[serde(default)]
    pub supports_checksum: Option<bool>,
    #[serde(default)]
    pub supports_parking: Option<bool>,
    #[serde(default)]
    pub thermal_presets: Option<Vec<ThermalPreset>>,
}
