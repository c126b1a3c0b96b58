//! Byte channel abstraction between the communicator and a device.
//!
//! The communicator is written once against [`PrinterTransport`]; a real
//! serial port and the in-process emulator are interchangeable.

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use thiserror::Error;

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The endpoint could not be opened.
    #[error("Failed to open {endpoint}: {source}")]
    Open {
        endpoint: String,
        source: std::io::Error,
    },

    /// No device is registered under this endpoint.
    #[error("No device at {0}")]
    NoDevice(String),

    /// The channel was closed.
    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A line-oriented, bidirectional channel to one device.
#[async_trait]
pub trait PrinterTransport: Send {
    /// The endpoint this transport is bound to (e.g. `/dev/ttyUSB0`).
    fn endpoint(&self) -> &str;

    /// Write one line. The terminator is appended by the transport.
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read the next non-empty line, without its terminator.
    ///
    /// Returns `Ok(None)` when the device closed the channel. Must be cancel
    /// safe: dropping the future loses no received bytes.
    async fn read_line(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports by endpoint name.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn PrinterTransport>, TransportError>;

    /// Endpoints worth probing when no candidates are configured.
    fn available_endpoints(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A serial port transport.
pub struct SerialTransport {
    endpoint: String,
    port: SerialPort,
    buffer: Vec<u8>,
}

impl SerialTransport {
    /// Open `endpoint` at `baud_rate`.
    pub fn open(endpoint: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = SerialPort::open(endpoint, baud_rate).map_err(|source| TransportError::Open {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            port,
            buffer: Vec::with_capacity(256),
        })
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}

#[async_trait]
impl PrinterTransport for SerialTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let data = format!("{line}\n");
        let bytes = data.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let n = self.port.write(&bytes[written..]).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            written += n;
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(Some(line));
            }
            let mut chunk = [0u8; 256];
            let n = self.port.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        Ok(())
    }
}

/// Opens [`SerialTransport`]s at a fixed baud rate.
pub struct SerialConnector {
    pub baud_rate: u32,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

#[async_trait]
impl TransportConnector for SerialConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn PrinterTransport>, TransportError> {
        let transport = SerialTransport::open(endpoint, self.baud_rate)?;
        Ok(Box::new(transport))
    }

    fn available_endpoints(&self) -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(ports) => ports.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate serial ports: {e}");
                Vec::new()
            }
        }
    }
}
