//! Printer communication layer.
//!
//! - `transport`: byte channel trait plus the serial port implementation
//! - `codec`: line framing and response parsing
//! - `profile`: firmware identification and capability profiles
//! - `communicator`: connection state machine, streaming and telemetry
//! - `emulator`: an in-process device for tests and dry runs

pub mod codec;
pub mod communicator;
pub mod emulator;
pub mod gcode;
pub mod profile;
pub mod transport;

pub use communicator::{CommError, CommStats, ConnectTarget, PrinterCommunicator};
pub use emulator::{EmulatedPrinter, EmulatorConnector, EmulatorScript};
pub use gcode::{GcodeProgram, ProgramError};
pub use profile::{ProfileResolver, ProfileTable};
pub use transport::{PrinterTransport, SerialConnector, TransportConnector, TransportError};
