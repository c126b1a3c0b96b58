//! Printer profile and connection models.
//!
//! A `PrinterProfile` is the immutable result of classifying a device's
//! firmware. A `PrinterConnection` is a read-only snapshot of the runtime
//! state of one communicator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ts_rs::TS;

/// Command/response conventions used by a class of printer firmware.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirmwareDialect {
    Marlin,
    Prusa,
    Klipper,
    Generic,
}

impl std::fmt::Display for FirmwareDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FirmwareDialect::Marlin => "Marlin",
            FirmwareDialect::Prusa => "Prusa",
            FirmwareDialect::Klipper => "Klipper",
            FirmwareDialect::Generic => "Generic",
        };
        f.write_str(name)
    }
}

/// Printable volume in millimetres.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, TS)]
pub struct BuildVolume {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A named hotend/bed temperature pair, in °C.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ThermalPreset {
    pub name: String,
    pub hotend: f64,
    pub bed: f64,
}

/// Immutable classification of a printer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct PrinterProfile {
    pub dialect: FirmwareDialect,

    /// Vendor or machine hint, e.g. `"Prusa MK4"`.
    pub vendor: Option<String>,

    /// Raw identification text returned by the device.
    pub firmware_banner: String,

    pub build_volume: BuildVolume,

    /// Commands must be framed as `N<seq> <cmd>*<checksum>`.
    pub supports_checksum: bool,

    /// The emergency stop may lift and park the head.
    pub supports_parking: bool,

    pub thermal_presets: Vec<ThermalPreset>,
}

/// Lifecycle of a printer connection.
///
/// Disconnected -> Connecting -> Connected <-> Streaming -> Disconnected.
/// `Error` is reachable from Connecting, Connected and Streaming.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

/// Progress of the active (or last) G-code stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, TS)]
pub struct StreamProgress {
    pub lines_sent: usize,
    pub total_lines: usize,
}

impl StreamProgress {
    /// Fraction of lines acknowledged, 0.0 to 1.0.
    ///
    /// An empty program counts as fully sent.
    pub fn fraction(&self) -> f64 {
        if self.total_lines == 0 {
            1.0
        } else {
            self.lines_sent as f64 / self.total_lines as f64
        }
    }
}

/// Latest readings from the telemetry poller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default, TS)]
pub struct Telemetry {
    /// Sensor name (`"T"`, `"T0"`, `"B"`) to current temperature in °C.
    pub temperatures: HashMap<String, f64>,

    /// Axis name (`"X"`, `"Y"`, `"Z"`, `"E"`) to position in mm.
    pub position: HashMap<String, f64>,

    pub updated_at: Option<DateTime<Utc>>,
}

/// How a stream session ended without error.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

/// Summary returned by a stream session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub lines_sent: usize,
    pub total_lines: usize,

    /// Lines re-sent after a timeout or a resend request.
    pub resends: u32,
}

/// Read-only snapshot of a printer connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct PrinterConnection {
    pub endpoint: Option<String>,
    pub profile: Option<PrinterProfile>,
    pub state: ConnectionState,
    pub telemetry: Telemetry,
    pub is_printing: bool,
    pub stream_progress: StreamProgress,
    pub last_error: Option<String>,
}

/// A device that answered a discovery probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct DiscoveredDevice {
    pub endpoint: String,
    pub profile: PrinterProfile,
}
