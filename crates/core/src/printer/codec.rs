//! Line protocol helpers.
//!
//! Framing (`N<seq> <cmd>*<checksum>`), response classification and
//! telemetry parsing for Marlin-style firmware. Klipper and Prusa speak a
//! compatible subset.

use std::collections::HashMap;

/// XOR of every byte in `line`.
pub fn checksum(line: &str) -> u8 {
    line.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Wrap a command with a line number and checksum.
///
/// ```
/// use pf_core::printer::codec::frame_line;
/// assert_eq!(frame_line(1, "G28"), "N1 G28*18");
/// ```
pub fn frame_line(seq: u32, command: &str) -> String {
    let body = format!("N{seq} {command}");
    let cs = checksum(&body);
    format!("{body}*{cs}")
}

/// Split a framed line back into `(seq, command)`.
///
/// Returns `None` for unframed lines or a checksum mismatch.
pub fn unframe_line(line: &str) -> Option<(u32, &str)> {
    let (body, cs) = line.rsplit_once('*')?;
    let cs: u8 = cs.trim().parse().ok()?;
    if checksum(body) != cs {
        return None;
    }
    let rest = body.strip_prefix('N')?;
    let (seq, command) = rest.split_once(' ')?;
    Some((seq.parse().ok()?, command))
}

/// Remove a trailing `;` comment and surrounding whitespace.
///
/// Returns `None` when nothing executable is left.
pub fn strip_comment(line: &str) -> Option<&str> {
    let code = match line.split_once(';') {
        Some((code, _)) => code,
        None => line,
    };
    let code = code.trim();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

/// The command word of a G-code line, upper-cased (`"G1"`, `"M104"`).
pub fn command_word(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Numeric value of a single-letter parameter such as `S` in `M104 S200`.
pub fn param(command: &str, letter: char) -> Option<f64> {
    command.split_whitespace().skip(1).find_map(|token| {
        let mut chars = token.chars();
        let first = chars.next()?;
        if first.eq_ignore_ascii_case(&letter) {
            chars.as_str().parse().ok()
        } else {
            None
        }
    })
}

/// Target temperature set by a heater command, if `command` is one.
///
/// `M104`/`M109` (hotend) and `M140`/`M190` (bed). A missing `S` means 0.
pub fn heater_target(command: &str) -> Option<f64> {
    match command_word(command).as_str() {
        "M104" | "M109" | "M140" | "M190" => Some(param(command, 'S').unwrap_or(0.0)),
        _ => None,
    }
}

/// Temperatures and positions parsed from a device line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub temperatures: HashMap<String, f64>,
    pub position: HashMap<String, f64>,
}

impl Readings {
    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty() && self.position.is_empty()
    }
}

fn is_temperature_key(key: &str) -> bool {
    match key {
        "T" | "B" | "C" => true,
        _ => key
            .strip_prefix('T')
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
    }
}

/// Parse `T:200.0 /200.0 B:60.0 /60.0` and `X:1.00 Y:2.00 Z:0.20 E:0.00`
/// fragments.
///
/// Targets (`/200.0`), power readings (`@:0`) and the stepper counts that
/// follow `Count` are ignored.
pub fn parse_readings(text: &str) -> Readings {
    let mut readings = Readings::default();
    for token in text.split_whitespace() {
        if token == "Count" {
            break;
        }
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        let value = value.split_once('/').map_or(value, |(current, _)| current);
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        if is_temperature_key(key) {
            readings.temperatures.insert(key.to_string(), value);
        } else if matches!(key, "X" | "Y" | "Z" | "E") {
            readings.position.insert(key.to_string(), value);
        }
    }
    readings
}

/// Classified line received from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    /// `ok`, possibly carrying temperatures.
    Ack(Readings),
    /// `Resend: <n>` / `rs <n>`: the device wants line `n` again.
    Resend(u32),
    /// `busy: processing`: the device is alive but still working.
    Busy,
    /// A recoverable line-number or checksum complaint. A `Resend` follows.
    LineError(String),
    /// `Error:` or `!!`: a firmware fault.
    Fault(String),
    /// An unsolicited temperature or position report.
    Report(Readings),
    /// Anything else (`echo:`, banners, `start`).
    Info(String),
}

const LINE_ERROR_MARKERS: [&str; 4] = [
    "checksum mismatch",
    "no checksum",
    "line number",
    "last line",
];

/// Classify one trimmed device line.
pub fn parse_response(line: &str) -> DeviceResponse {
    let line = line.trim();

    if line == "ok" || line.starts_with("ok ") {
        return DeviceResponse::Ack(parse_readings(&line[2..]));
    }

    if let Some(rest) = line
        .strip_prefix("Resend:")
        .or_else(|| line.strip_prefix("rs "))
    {
        if let Ok(n) = rest.trim().trim_start_matches('N').parse() {
            return DeviceResponse::Resend(n);
        }
    }

    if line.starts_with("busy:") || line.starts_with("echo:busy") {
        return DeviceResponse::Busy;
    }

    if let Some(message) = line.strip_prefix("Error:") {
        let lower = message.to_ascii_lowercase();
        if LINE_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
            return DeviceResponse::LineError(message.trim().to_string());
        }
        return DeviceResponse::Fault(message.trim().to_string());
    }

    if line.starts_with("!!") {
        let message = line.trim_start_matches('!').trim();
        let message = if message.is_empty() { "!!" } else { message };
        return DeviceResponse::Fault(message.to_string());
    }

    let readings = parse_readings(line);
    if !readings.is_empty() {
        return DeviceResponse::Report(readings);
    }

    DeviceResponse::Info(line.to_string())
}
