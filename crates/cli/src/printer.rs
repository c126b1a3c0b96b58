//! Printer selection from command-line flags and configuration.

use crate::PrinterArgs;
use pf_core::config::AppConfig;
use pf_core::printer::{
    ConnectTarget, EmulatedPrinter, EmulatorConnector, EmulatorScript, PrinterCommunicator,
    SerialConnector, TransportConnector,
};
use std::sync::Arc;
use std::time::Duration;

/// Endpoint name of the built-in emulated printer.
pub const EMULATOR_ENDPOINT: &str = "emulator0";

pub fn connector(config: &AppConfig, args: &PrinterArgs) -> Arc<dyn TransportConnector> {
    if args.emulated {
        let device = EmulatedPrinter::new(
            EmulatorScript::marlin().with_ack_delay(Duration::from_millis(2)),
        );
        Arc::new(EmulatorConnector::new().with_device(EMULATOR_ENDPOINT, device))
    } else {
        Arc::new(SerialConnector::new(config.global.printer.baud_rate))
    }
}

/// Endpoints to probe, most specific source first.
///
/// An empty list means "every port the connector can enumerate".
pub fn candidates(config: &AppConfig, args: &PrinterArgs) -> Vec<String> {
    if args.emulated {
        return vec![EMULATOR_ENDPOINT.to_string()];
    }
    if !args.ports.is_empty() {
        return args.ports.clone();
    }
    if !config.global.discovery.candidate_ports.is_empty() {
        return config.global.discovery.candidate_ports.clone();
    }
    config.global.printer.port.iter().cloned().collect()
}

/// Whether the flags ask for a real or emulated device at all.
pub fn requested(args: &PrinterArgs) -> bool {
    args.emulated || !args.ports.is_empty()
}

pub fn communicator(config: &AppConfig, args: &PrinterArgs) -> PrinterCommunicator {
    PrinterCommunicator::new(
        connector(config, args),
        config.global.printer.clone(),
        config.profile_table(),
    )
}

pub fn target(config: &AppConfig, args: &PrinterArgs) -> ConnectTarget {
    ConnectTarget::Discover {
        candidates: candidates(config, args),
        per_endpoint_timeout: config.global.discovery.per_endpoint_timeout(),
    }
}
