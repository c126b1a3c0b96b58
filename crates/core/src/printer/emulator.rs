//! In-process emulated printer.
//!
//! `EmulatedPrinter` answers like a Marlin-family device: `ok` acks,
//! `M105`/`M114` reports, `M115` identification, line-number and checksum
//! validation. An [`EmulatorScript`] injects the misbehaviour tests need
//! (silence, faults, resend requests, slow acks). Every received line is
//! recorded so tests can assert on exactly what was sent.

use crate::printer::codec::{command_word, param, unframe_line};
use crate::printer::transport::{PrinterTransport, TransportConnector, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const MARLIN_BANNER: &str = "FIRMWARE_NAME:Marlin 2.1.2.1 (Aug  1 2023 12:00:00) \
SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 \
MACHINE_TYPE:Ender-3 V2 EXTRUDER_COUNT:1";
const PRUSA_BANNER: &str = "FIRMWARE_NAME:Prusa-Firmware 3.13.2 based on Marlin \
FIRMWARE_URL:https://github.com/prusa3d/Prusa-Firmware PROTOCOL_VERSION:1.0 \
MACHINE_TYPE:Prusa i3 MK3S EXTRUDER_COUNT:1";
const KLIPPER_BANNER: &str = "FIRMWARE_NAME:Klipper FIRMWARE_VERSION:v0.12.0";

/// How the M115 identification request is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    /// Banner lines followed by `ok`.
    Lines(Vec<String>),
    /// A single `ok <banner>` line (Klipper style).
    InlineAck(String),
    /// `echo:Unknown command` and no ack.
    Unknown,
}

/// Behaviour of an emulated device.
#[derive(Debug, Clone)]
pub struct EmulatorScript {
    pub identification: Identification,
    /// Answer nothing at all.
    pub unresponsive: bool,
    /// Delay applied to every response.
    pub ack_delay: Duration,
    /// Commands that are received but never acknowledged.
    pub never_ack: HashSet<String>,
    /// Commands answered with `Error:<message>`.
    pub faults: HashMap<String, String>,
    /// Commands answered once with a checksum complaint and `Resend`.
    pub resend_once: HashSet<String>,
    /// Commands answered with `n` busy keepalives spaced by the interval before `ok`.
    pub keepalive: HashMap<String, (u32, Duration)>,
}

impl EmulatorScript {
    fn with_identification(identification: Identification) -> Self {
        Self {
            identification,
            unresponsive: false,
            ack_delay: Duration::ZERO,
            never_ack: HashSet::new(),
            faults: HashMap::new(),
            resend_once: HashSet::new(),
            keepalive: HashMap::new(),
        }
    }

    /// A stock Marlin machine (Creality Ender-3 V2).
    pub fn marlin() -> Self {
        Self::with_identification(Identification::Lines(vec![
            MARLIN_BANNER.to_string(),
            "Cap:AUTOREPORT_TEMP:1".to_string(),
        ]))
    }

    /// A Prusa i3 MK3S.
    pub fn prusa() -> Self {
        Self::with_identification(Identification::Lines(vec![PRUSA_BANNER.to_string()]))
    }

    /// A Klipper host.
    pub fn klipper() -> Self {
        Self::with_identification(Identification::InlineAck(KLIPPER_BANNER.to_string()))
    }

    /// A Marlin-compatible device that does not identify itself.
    pub fn anonymous() -> Self {
        Self::with_identification(Identification::Lines(Vec::new()))
    }

    /// A device that acks commands but does not understand M115.
    pub fn generic() -> Self {
        Self::with_identification(Identification::Unknown)
    }

    /// A device that never answers.
    pub fn unresponsive() -> Self {
        let mut script = Self::generic();
        script.unresponsive = true;
        script
    }

    pub fn never_ack(mut self, command: &str) -> Self {
        self.never_ack.insert(command.to_string());
        self
    }

    pub fn fault_on(mut self, command: &str, message: &str) -> Self {
        self.faults.insert(command.to_string(), message.to_string());
        self
    }

    pub fn resend_once(mut self, command: &str) -> Self {
        self.resend_once.insert(command.to_string());
        self
    }

    pub fn keepalive(mut self, command: &str, count: u32, interval: Duration) -> Self {
        self.keepalive.insert(command.to_string(), (count, interval));
        self
    }

    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }
}

struct Outgoing {
    line: String,
    ready_at: Instant,
}

struct DeviceState {
    script: EmulatorScript,
    received: Vec<String>,
    commands: Vec<String>,
    outbox: VecDeque<Outgoing>,
    expected_line: u32,
    hotend: (f64, f64),
    bed: (f64, f64),
    fan: f64,
    position: [f64; 4],
    relative: bool,
    open: bool,
}

/// A shared handle to one emulated device.
#[derive(Clone)]
pub struct EmulatedPrinter {
    state: Arc<Mutex<DeviceState>>,
    notify: Arc<Notify>,
}

impl EmulatedPrinter {
    pub fn new(script: EmulatorScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                script,
                received: Vec::new(),
                commands: Vec::new(),
                outbox: VecDeque::new(),
                expected_line: 1,
                hotend: (21.0, 0.0),
                bed: (21.0, 0.0),
                fan: 0.0,
                position: [0.0; 4],
                relative: false,
                open: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a transport to this device.
    pub fn transport(&self, endpoint: &str) -> EmulatedTransport {
        self.lock().open = true;
        EmulatedTransport {
            endpoint: endpoint.to_string(),
            device: self.clone(),
        }
    }

    /// Every line received, exactly as written by the host.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// Every command received, with line number and checksum removed.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// How many times `command` was received.
    pub fn count_of(&self, command: &str) -> usize {
        self.lock().commands.iter().filter(|c| *c == command).count()
    }

    /// Current `(hotend target, bed target)`.
    pub fn heater_targets(&self) -> (f64, f64) {
        let state = self.lock();
        (state.hotend.1, state.bed.1)
    }

    pub fn fan_speed(&self) -> f64 {
        self.lock().fan
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn receive(&self, raw: &str) {
        let mut state = self.lock();
        state.received.push(raw.to_string());

        let (seq, command) = match unframe_line(raw) {
            Some((seq, command)) => (Some(seq), command.to_string()),
            None if raw.starts_with('N') && raw.contains('*') => {
                let expected = state.expected_line;
                state.push_lines(
                    vec![
                        format!("Error:checksum mismatch, Last Line: {}", expected - 1),
                        format!("Resend: {expected}"),
                        "ok".to_string(),
                    ],
                    Duration::ZERO,
                );
                drop(state);
                self.notify.notify_one();
                return;
            }
            None => (None, raw.trim().to_string()),
        };
        state.commands.push(command.clone());

        if state.script.unresponsive || state.script.never_ack.contains(&command) {
            return;
        }

        if let Some(seq) = seq {
            if command_word(&command) != "M110" && seq != state.expected_line {
                let expected = state.expected_line;
                state.push_lines(
                    vec![
                        format!(
                            "Error:Line Number is not Last Line Number+1, Last Line: {}",
                            expected - 1
                        ),
                        format!("Resend: {expected}"),
                        "ok".to_string(),
                    ],
                    Duration::ZERO,
                );
                drop(state);
                self.notify.notify_one();
                return;
            }
        }

        if state.script.resend_once.remove(&command) {
            let expected = seq.unwrap_or(state.expected_line);
            state.push_lines(
                vec![
                    format!("Error:checksum mismatch, Last Line: {}", expected.saturating_sub(1)),
                    format!("Resend: {expected}"),
                    "ok".to_string(),
                ],
                Duration::ZERO,
            );
            drop(state);
            self.notify.notify_one();
            return;
        }

        if let Some(seq) = seq {
            state.expected_line = seq + 1;
        }

        if let Some(message) = state.script.faults.get(&command).cloned() {
            state.push_lines(vec![format!("Error:{message}")], Duration::ZERO);
            drop(state);
            self.notify.notify_one();
            return;
        }

        let mut lines = Vec::new();
        if let Some((count, interval)) = state.script.keepalive.get(&command).copied() {
            let now = Instant::now() + state.script.ack_delay;
            for i in 1..=count {
                state.outbox.push_back(Outgoing {
                    line: "echo:busy: processing".to_string(),
                    ready_at: now + interval * i,
                });
            }
            state.outbox.push_back(Outgoing {
                line: "ok".to_string(),
                ready_at: now + interval * (count + 1),
            });
        } else {
            state.execute(&command, &mut lines);
            let delay = state.script.ack_delay;
            state.push_lines(lines, delay);
        }
        drop(state);
        self.notify.notify_one();
    }
}

impl DeviceState {
    fn push_lines(&mut self, lines: Vec<String>, delay: Duration) {
        let ready_at = Instant::now() + delay;
        for line in lines {
            self.outbox.push_back(Outgoing { line, ready_at });
        }
    }

    fn temperature_report(&self) -> String {
        format!(
            "T:{:.2} /{:.2} B:{:.2} /{:.2} @:0 B@:0",
            self.hotend.0, self.hotend.1, self.bed.0, self.bed.1
        )
    }

    fn execute(&mut self, command: &str, out: &mut Vec<String>) {
        let word = command_word(command);
        match word.as_str() {
            "M115" => match &self.script.identification {
                Identification::Lines(lines) => {
                    out.extend(lines.iter().cloned());
                    out.push("ok".to_string());
                }
                Identification::InlineAck(banner) => out.push(format!("ok {banner}")),
                Identification::Unknown => {
                    out.push("echo:Unknown command: \"M115\"".to_string());
                }
            },
            "M105" => out.push(format!("ok {}", self.temperature_report())),
            "M114" => {
                let [x, y, z, e] = self.position;
                out.push(format!(
                    "X:{x:.2} Y:{y:.2} Z:{z:.2} E:{e:.2} Count X:0 Y:0 Z:0"
                ));
                out.push("ok".to_string());
            }
            "M104" | "M109" => {
                let target = param(command, 'S').unwrap_or(0.0);
                self.hotend = (target.max(21.0), target);
                out.push("ok".to_string());
            }
            "M140" | "M190" => {
                let target = param(command, 'S').unwrap_or(0.0);
                self.bed = (target.max(21.0), target);
                out.push("ok".to_string());
            }
            "M106" => {
                self.fan = param(command, 'S').unwrap_or(255.0);
                out.push("ok".to_string());
            }
            "M107" => {
                self.fan = 0.0;
                out.push("ok".to_string());
            }
            "G90" => {
                self.relative = false;
                out.push("ok".to_string());
            }
            "G91" => {
                self.relative = true;
                out.push("ok".to_string());
            }
            "G28" => {
                self.position = [0.0; 4];
                out.push("ok".to_string());
            }
            "G0" | "G1" => {
                for (i, axis) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(value) = param(command, axis) {
                        if self.relative {
                            self.position[i] += value;
                        } else {
                            self.position[i] = value;
                        }
                    }
                }
                out.push("ok".to_string());
            }
            "M110" => {
                self.expected_line = param(command, 'N').map_or(0, |n| n as u32) + 1;
                out.push("ok".to_string());
            }
            w if w.starts_with('G') || w.starts_with('M') || w.starts_with('T') => {
                out.push("ok".to_string());
            }
            _ => {
                out.push(format!("echo:Unknown command: \"{command}\""));
                out.push("ok".to_string());
            }
        }
    }
}

/// Transport bound to an [`EmulatedPrinter`].
pub struct EmulatedTransport {
    endpoint: String,
    device: EmulatedPrinter,
}

#[async_trait]
impl PrinterTransport for EmulatedTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.device.is_open() {
            return Err(TransportError::Closed);
        }
        self.device.receive(line);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let notified = self.device.notify.notified();
            let next_ready = {
                let mut state = self.device.lock();
                if !state.open {
                    return Ok(None);
                }
                match state.outbox.front() {
                    Some(out) if out.ready_at <= Instant::now() => {
                        let line = state.outbox.pop_front().map(|o| o.line);
                        return Ok(line);
                    }
                    Some(out) => Some(out.ready_at),
                    None => None,
                }
            };
            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.device.lock();
        state.open = false;
        state.outbox.clear();
        drop(state);
        self.device.notify.notify_waiters();
        Ok(())
    }
}

/// Maps endpoint names to emulated devices.
#[derive(Clone, Default)]
pub struct EmulatorConnector {
    devices: HashMap<String, EmulatedPrinter>,
}

impl EmulatorConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, endpoint: &str, device: EmulatedPrinter) -> Self {
        self.devices.insert(endpoint.to_string(), device);
        self
    }

    pub fn device(&self, endpoint: &str) -> Option<&EmulatedPrinter> {
        self.devices.get(endpoint)
    }
}

#[async_trait]
impl TransportConnector for EmulatorConnector {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn PrinterTransport>, TransportError> {
        let device = self
            .devices
            .get(endpoint)
            .ok_or_else(|| TransportError::NoDevice(endpoint.to_string()))?;
        Ok(Box::new(device.transport(endpoint)))
    }

    fn available_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.devices.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}
