//! Test fixtures: settings, emulated printers and G-code programs.

#![allow(dead_code)]

use pf_core::agents::{AgentRegistry, PhaseAgent};
use pf_core::printer::{
    ConnectTarget, EmulatedPrinter, EmulatorConnector, EmulatorScript, GcodeProgram,
    PrinterCommunicator, ProfileTable,
};
use pf_core::Orchestrator;
use pf_protocol::config_models::{OrchestratorSettings, PrinterSettings};
use pf_protocol::printer_models::{FirmwareDialect, PrinterProfile};
use pf_protocol::workflow_models::Phase;
use std::path::Path;
use std::sync::Arc;

/// Endpoint the emulated printer is registered under.
pub const ENDPOINT: &str = "emu0";

/// Orchestrator settings with a private scratch root and short timeouts.
pub fn orchestrator_settings(scratch: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        research_timeout_secs: 5,
        cad_timeout_secs: 5,
        slicing_timeout_secs: 5,
        printing_timeout_secs: 10,
        timeout_retries: 0,
        scratch_dir: Some(scratch.to_path_buf()),
    }
}

/// Printer settings tuned for fast tests. Telemetry polling is effectively
/// off so it never interleaves with the lines under test.
pub fn printer_settings() -> PrinterSettings {
    PrinterSettings {
        ack_timeout_ms: 50,
        max_retries: 3,
        telemetry_interval_ms: 60_000,
        connect_timeout_ms: 500,
        ..PrinterSettings::default()
    }
}

/// A communicator wired to one emulated device at [`ENDPOINT`].
pub fn emulated(script: EmulatorScript) -> (PrinterCommunicator, EmulatedPrinter) {
    emulated_with(script, printer_settings())
}

pub fn emulated_with(
    script: EmulatorScript,
    settings: PrinterSettings,
) -> (PrinterCommunicator, EmulatedPrinter) {
    let device = EmulatedPrinter::new(script);
    let connector = EmulatorConnector::new().with_device(ENDPOINT, device.clone());
    let communicator =
        PrinterCommunicator::new(Arc::new(connector), settings, ProfileTable::new());
    (communicator, device)
}

/// Built-in profile for `dialect`.
pub fn profile(dialect: FirmwareDialect) -> PrinterProfile {
    ProfileTable::defaults_for(dialect, None)
}

/// Connect `communicator` to [`ENDPOINT`] with a known profile.
pub async fn connect(communicator: &PrinterCommunicator, dialect: FirmwareDialect) {
    communicator
        .connect(ConnectTarget::Profile {
            endpoint: ENDPOINT.to_string(),
            profile: profile(dialect),
        })
        .await
        .expect("Failed to connect to emulated printer");
}

/// `count` absolute moves: `G1 X1`, `G1 X2`, ...
pub fn moves(count: usize) -> GcodeProgram {
    let text: Vec<String> = (1..=count).map(|i| format!("G1 X{i}")).collect();
    GcodeProgram::from_text("moves", &text.join("\n"))
}

/// A program that heats the hotend and bed before `count` moves.
pub fn heated_moves(count: usize) -> GcodeProgram {
    let mut text = vec!["M140 S60".to_string(), "M104 S200".to_string()];
    text.extend((1..=count).map(|i| format!("G1 X{i}")));
    GcodeProgram::from_text("heated", &text.join("\n"))
}

/// An orchestrator whose agents are the stock mocks with `overrides` applied.
pub fn orchestrator_with(
    scratch: &Path,
    overrides: Vec<(Phase, Arc<dyn PhaseAgent>)>,
) -> Orchestrator {
    let mut agents = AgentRegistry::with_mock_agents();
    for (phase, agent) in overrides {
        agents.register(phase, agent);
    }
    Orchestrator::new(agents, orchestrator_settings(scratch))
}
