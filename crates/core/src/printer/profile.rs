//! Firmware profile resolution.
//!
//! Probes endpoints with an identification request (`M115`), classifies the
//! answer into a [`FirmwareDialect`] and attaches capability defaults from a
//! static table keyed by dialect and vendor hint.

use crate::printer::codec::{parse_response, DeviceResponse};
use crate::printer::transport::{PrinterTransport, TransportConnector};
use pf_protocol::config_models::ProfileOverride;
use pf_protocol::printer_models::{
    BuildVolume, DiscoveredDevice, FirmwareDialect, PrinterProfile, ThermalPreset,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

/// Known firmware signatures, checked in order.
///
/// Prusa comes before Marlin because Prusa banners say "based on Marlin".
const SIGNATURES: [(&str, FirmwareDialect); 3] = [
    ("Prusa-Firmware", FirmwareDialect::Prusa),
    ("Klipper", FirmwareDialect::Klipper),
    ("FIRMWARE_NAME:Marlin", FirmwareDialect::Marlin),
];

/// Result of classifying an identification banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub dialect: FirmwareDialect,
    pub vendor: Option<String>,
}

/// Classify an identification banner.
///
/// Rules, first match wins:
/// 1. a known firmware signature anywhere in the banner;
/// 2. the device acknowledged the request with a Marlin-style `ok`;
/// 3. `Generic`.
///
/// # Arguments
///
/// * `lines` - Lines received in answer to `M115` (the `ok` line's payload included)
/// * `acked` - Whether the device sent an `ok`
pub fn classify_banner(lines: &[String], acked: bool) -> Classification {
    let vendor = lines.iter().find_map(|line| machine_type(line));

    let dialect = SIGNATURES
        .iter()
        .find(|(signature, _)| lines.iter().any(|line| line.contains(signature)))
        .map(|(_, dialect)| *dialect)
        .unwrap_or(if acked {
            FirmwareDialect::Marlin
        } else {
            FirmwareDialect::Generic
        });

    Classification { dialect, vendor }
}

/// Extract the `MACHINE_TYPE:` value from a Marlin capability line.
///
/// The value may contain spaces and runs until the next `KEY:` word.
fn machine_type(line: &str) -> Option<String> {
    let (_, rest) = line.split_once("MACHINE_TYPE:")?;
    let words: Vec<&str> = rest
        .split_whitespace()
        .take_while(|word| !is_capability_key(word))
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn is_capability_key(word: &str) -> bool {
    match word.split_once(':') {
        Some((key, _)) => {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_uppercase() || c == '_')
        }
        None => false,
    }
}

fn preset(name: &str, hotend: f64, bed: f64) -> ThermalPreset {
    ThermalPreset {
        name: name.to_string(),
        hotend,
        bed,
    }
}

struct VendorDefaults {
    hint: &'static str,
    volume: (f64, f64, f64),
}

/// Build volumes of common machines, matched against the vendor hint.
const VENDORS: [VendorDefaults; 6] = [
    VendorDefaults { hint: "ender-3", volume: (220.0, 220.0, 250.0) },
    VendorDefaults { hint: "ender-5", volume: (220.0, 220.0, 300.0) },
    VendorDefaults { hint: "mini", volume: (180.0, 180.0, 180.0) },
    VendorDefaults { hint: "mk4", volume: (250.0, 210.0, 220.0) },
    VendorDefaults { hint: "mk3", volume: (250.0, 210.0, 210.0) },
    VendorDefaults { hint: "voron", volume: (350.0, 350.0, 340.0) },
];

/// Static capability defaults plus user overrides.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    overrides: Vec<ProfileOverride>,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that applies `overrides` on top of the built-in defaults.
    pub fn with_overrides(overrides: Vec<ProfileOverride>) -> Self {
        Self { overrides }
    }

    /// Built-in defaults for a dialect and optional vendor hint.
    pub fn defaults_for(dialect: FirmwareDialect, vendor: Option<&str>) -> PrinterProfile {
        let (volume, supports_checksum, supports_parking, thermal_presets) = match dialect {
            FirmwareDialect::Marlin => (
                (220.0, 220.0, 250.0),
                true,
                true,
                vec![preset("PLA", 200.0, 60.0), preset("PETG", 235.0, 80.0)],
            ),
            FirmwareDialect::Prusa => (
                (250.0, 210.0, 210.0),
                true,
                true,
                vec![
                    preset("PLA", 215.0, 60.0),
                    preset("PETG", 240.0, 85.0),
                    preset("ASA", 260.0, 105.0),
                ],
            ),
            FirmwareDialect::Klipper => (
                (300.0, 300.0, 300.0),
                false,
                true,
                vec![preset("PLA", 205.0, 60.0), preset("ABS", 245.0, 100.0)],
            ),
            FirmwareDialect::Generic => (
                (200.0, 200.0, 200.0),
                false,
                false,
                vec![preset("PLA", 200.0, 60.0)],
            ),
        };

        let hint = vendor.map(str::to_ascii_lowercase);
        let (x, y, z) = hint
            .as_deref()
            .and_then(|h| VENDORS.iter().find(|v| h.contains(v.hint)))
            .map_or(volume, |v| v.volume);

        PrinterProfile {
            dialect,
            vendor: vendor.map(str::to_string),
            firmware_banner: String::new(),
            build_volume: BuildVolume { x, y, z },
            supports_checksum,
            supports_parking,
            thermal_presets,
        }
    }

    /// Build the profile for a classified device.
    pub fn profile_for(&self, classification: &Classification, banner: String) -> PrinterProfile {
        let mut profile =
            Self::defaults_for(classification.dialect, classification.vendor.as_deref());
        profile.firmware_banner = banner;

        let hint = classification
            .vendor
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        for rule in self.overrides.iter().filter(|rule| {
            rule.dialect == classification.dialect
                && rule
                    .vendor_match
                    .as_ref()
                    .map_or(true, |m| hint.contains(&m.to_ascii_lowercase()))
        }) {
            debug!("Applying profile override '{}'", rule.name);
            if let Some(volume) = rule.build_volume {
                profile.build_volume = volume;
            }
            if let Some(checksum) = rule.supports_checksum {
                profile.supports_checksum = checksum;
            }
            if let Some(parking) = rule.supports_parking {
                profile.supports_parking = parking;
            }
            if let Some(presets) = &rule.thermal_presets {
                profile.thermal_presets = presets.clone();
            }
        }
        profile
    }
}

/// Discovers and classifies devices.
#[derive(Clone)]
pub struct ProfileResolver {
    connector: Arc<dyn TransportConnector>,
    table: Arc<ProfileTable>,
}

impl ProfileResolver {
    pub fn new(connector: Arc<dyn TransportConnector>, table: Arc<ProfileTable>) -> Self {
        Self { connector, table }
    }

    /// Probe every candidate concurrently and classify those that answer.
    ///
    /// Each probe is bounded by `per_endpoint_timeout`, so the whole pass
    /// takes about one timeout regardless of the number of candidates.
    /// Silent endpoints are omitted, not retried. Results keep the order of
    /// `candidates`.
    pub async fn discover(
        &self,
        candidates: &[String],
        per_endpoint_timeout: Duration,
    ) -> Vec<DiscoveredDevice> {
        let mut probes = JoinSet::new();
        for (index, endpoint) in candidates.iter().enumerate() {
            let resolver = self.clone();
            let endpoint = endpoint.clone();
            probes.spawn(async move {
                (index, resolver.probe(&endpoint, per_endpoint_timeout).await)
            });
        }

        let mut found = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((index, Some(device))) => found.push((index, device)),
                Ok((_, None)) => {}
                Err(e) => debug!("Discovery probe task failed: {e}"),
            }
        }
        found.sort_by_key(|(index, _)| *index);

        info!(
            "Discovery found {} device(s) among {} candidate(s)",
            found.len(),
            candidates.len()
        );
        found.into_iter().map(|(_, device)| device).collect()
    }

    /// Probe a single endpoint.
    ///
    /// Returns `None` if the endpoint cannot be opened or sends nothing
    /// before the deadline.
    pub async fn probe(&self, endpoint: &str, timeout: Duration) -> Option<DiscoveredDevice> {
        let deadline = Instant::now() + timeout;

        let mut transport =
            match tokio::time::timeout_at(deadline, self.connector.open(endpoint)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    debug!("Probe of {endpoint} failed: {e}");
                    return None;
                }
                Err(_) => {
                    debug!("Probe of {endpoint} timed out while opening");
                    return None;
                }
            };

        let mut banner = Vec::new();
        let acked = tokio::time::timeout_at(deadline, identify(transport.as_mut(), &mut banner))
            .await
            .unwrap_or(false);
        if let Err(e) = transport.close().await {
            debug!("Closing probe transport for {endpoint} failed: {e}");
        }

        if banner.is_empty() && !acked {
            debug!("No answer from {endpoint}");
            return None;
        }

        let classification = classify_banner(&banner, acked);
        info!(
            "Found {} device at {endpoint} ({})",
            classification.dialect,
            classification.vendor.as_deref().unwrap_or("unknown vendor")
        );
        Some(DiscoveredDevice {
            endpoint: endpoint.to_string(),
            profile: self.table.profile_for(&classification, banner.join("\n")),
        })
    }
}

/// Send `M115` and collect the answer. Returns whether an `ok` arrived.
async fn identify(transport: &mut dyn PrinterTransport, banner: &mut Vec<String>) -> bool {
    if transport.write_line("M115").await.is_err() {
        return false;
    }
    loop {
        let line = match transport.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return false,
        };
        match parse_response(&line) {
            DeviceResponse::Ack(_) => {
                let payload = line.trim().trim_start_matches("ok").trim();
                if !payload.is_empty() {
                    banner.push(payload.to_string());
                }
                return true;
            }
            DeviceResponse::Fault(_) => {
                banner.push(line);
                return false;
            }
            _ => banner.push(line),
        }
    }
}
