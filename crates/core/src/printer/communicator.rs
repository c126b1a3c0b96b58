//! Printer communicator.
//!
//! Owns one connection to one device and runs the streaming protocol on it:
//! send a line, wait for `ok`, resend on timeout, abort on firmware faults,
//! and issue an emergency stop when a stream dies. A background task polls
//! temperatures and position independently of streaming.
//!
//! Connection lifecycle:
//! Disconnected -> Connecting -> Connected <-> Streaming -> Disconnected,
//! with `Error` reachable from Connecting, Connected and Streaming.

use crate::cancel::CancelToken;
use crate::printer::codec::{
    command_word, frame_line, heater_target, parse_response, DeviceResponse, Readings,
};
use crate::printer::gcode::{GcodeProgram, ProgramError};
use crate::printer::profile::{ProfileResolver, ProfileTable};
use crate::printer::transport::{PrinterTransport, TransportConnector, TransportError};
use chrono::Utc;
use pf_protocol::config_models::PrinterSettings;
use pf_protocol::ipc::Event;
use pf_protocol::printer_models::{
    ConnectionState, PrinterConnection, PrinterProfile, StreamOutcome, StreamProgress,
    StreamReport, Telemetry,
};
use pf_protocol::workflow_models::error_kind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Errors returned by the communicator.
#[derive(Error, Debug)]
pub enum CommError {
    /// Another program is already streaming on this connection.
    #[error("Connection is busy streaming another program")]
    Busy,

    #[error("Printer is not connected (state: {0:?})")]
    NotConnected(ConnectionState),

    #[error("Printer is already connected")]
    AlreadyConnected,

    #[error("No printer answered discovery")]
    NoDeviceFound,

    #[error("Timed out opening {0}")]
    ConnectTimeout(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The stream was aborted by a firmware fault or an exhausted retry budget.
    #[error("Stream aborted at line {line}: {reason}")]
    Stream { line: usize, reason: String },

    #[error(transparent)]
    Program(#[from] ProgramError),
}

impl CommError {
    /// The error taxonomy kind reported to workflows.
    pub fn kind(&self) -> &'static str {
        match self {
            CommError::Busy => error_kind::BUSY,
            CommError::NotConnected(_) | CommError::AlreadyConnected => error_kind::NOT_CONNECTED,
            CommError::NoDeviceFound | CommError::ConnectTimeout(_) => error_kind::TIMEOUT,
            CommError::Transport(_) => error_kind::TRANSPORT,
            CommError::Stream { .. } => error_kind::STREAM,
            CommError::Program(_) => error_kind::PROGRAM,
        }
    }
}

/// How to pick the device to connect to.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// A known endpoint with an already-resolved profile.
    Profile {
        endpoint: String,
        profile: PrinterProfile,
    },
    /// Discover devices and use the first one that answers.
    ///
    /// An empty candidate list probes every endpoint the connector reports.
    Discover {
        candidates: Vec<String>,
        per_endpoint_timeout: Duration,
    },
}

/// Counters kept for the lifetime of a communicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommStats {
    pub lines_sent: u64,
    pub resends: u64,
    pub ack_timeouts: u64,
    pub faults: u64,
    pub safe_stops: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMark {
    Idle,
    Active,
    Completed,
    Cancelled,
    /// The stream future was dropped mid-session.
    Interrupted,
    SafeStopped,
}

struct Record {
    endpoint: Option<String>,
    profile: Option<PrinterProfile>,
    telemetry: Telemetry,
    last_error: Option<String>,
    stats: CommStats,
    next_seq: u32,
    hotend_on: bool,
    bed_on: bool,
    session: SessionMark,
    /// Cancel token of the caller that started the last session.
    owner: Option<CancelToken>,
    /// A safe stop is using the line outside any session.
    stopping: bool,
}

impl Record {
    fn heaters_on(&self) -> bool {
        self.hotend_on || self.bed_on
    }
}

enum LineOutcome {
    Acked(Readings),
    TimedOut,
    ResendRequested(u32),
    Fault(String),
    Broken(String),
}

struct Shared {
    connector: Arc<dyn TransportConnector>,
    table: Arc<ProfileTable>,
    settings: PrinterSettings,
    transport: tokio::sync::Mutex<Option<Box<dyn PrinterTransport>>>,
    record: Mutex<Record>,
    state_tx: watch::Sender<ConnectionState>,
    progress_tx: watch::Sender<StreamProgress>,
    events_tx: broadcast::Sender<Event>,
    session_abort: Mutex<CancelToken>,
    poller: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

/// Drives one printer connection.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct PrinterCommunicator {
    shared: Arc<Shared>,
}

impl PrinterCommunicator {
    /// Create a disconnected communicator.
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens transports (serial or emulated)
    /// * `settings` - Ack timeout, retry budget, telemetry interval
    /// * `table` - Capability defaults used when discovering devices
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        settings: PrinterSettings,
        table: ProfileTable,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (progress_tx, _) = watch::channel(StreamProgress::default());
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                connector,
                table: Arc::new(table),
                settings,
                transport: tokio::sync::Mutex::new(None),
                record: Mutex::new(Record {
                    endpoint: None,
                    profile: None,
                    telemetry: Telemetry::default(),
                    last_error: None,
                    stats: CommStats::default(),
                    next_seq: 1,
                    hotend_on: false,
                    bed_on: false,
                    session: SessionMark::Idle,
                    owner: None,
                    stopping: false,
                }),
                state_tx,
                progress_tx,
                events_tx,
                session_abort: Mutex::new(CancelToken::new()),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Progress of the current stream, updated after every acknowledged line.
    pub fn subscribe_progress(&self) -> watch::Receiver<StreamProgress> {
        self.shared.progress_tx.subscribe()
    }

    /// State changes, telemetry readings and per-line stream progress.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.shared.events_tx.subscribe()
    }

    pub fn stats(&self) -> CommStats {
        self.shared.record().stats
    }

    pub fn settings(&self) -> &PrinterSettings {
        &self.shared.settings
    }

    /// A read-only copy of the connection record.
    pub fn snapshot(&self) -> PrinterConnection {
        let state = self.state();
        let stream_progress = *self.shared.progress_tx.borrow();
        let record = self.shared.record();
        PrinterConnection {
            endpoint: record.endpoint.clone(),
            profile: record.profile.clone(),
            state,
            telemetry: record.telemetry.clone(),
            is_printing: state == ConnectionState::Streaming,
            stream_progress,
            last_error: record.last_error.clone(),
        }
    }

    /// Open a connection and start telemetry polling.
    ///
    /// Allowed from `Disconnected` and `Error`.
    ///
    /// # Errors
    ///
    /// - `AlreadyConnected` if a connection is open or being opened
    /// - `NoDeviceFound` if discovery finds nothing
    /// - `ConnectTimeout` / `Transport` if the endpoint cannot be opened
    pub async fn connect(&self, target: ConnectTarget) -> Result<PrinterProfile, CommError> {
        let mut claimed = Ok(());
        self.shared.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Disconnected | ConnectionState::Error => {
                *state = ConnectionState::Connecting;
                true
            }
            _ => {
                claimed = Err(CommError::AlreadyConnected);
                false
            }
        });
        claimed?;
        self.shared.emit_state(ConnectionState::Connecting);

        // Leftovers from a connection that ended in Error.
        self.shared.stop_poller().await;
        if let Some(mut old) = self.shared.transport.lock().await.take() {
            let _ = old.close().await;
        }

        match self.open(target).await {
            Ok((transport, endpoint, profile)) => {
                info!(
                    "Connected to {} printer at {endpoint} (checksum: {})",
                    profile.dialect, profile.supports_checksum
                );
                *self.shared.transport.lock().await = Some(transport);
                {
                    let mut record = self.shared.record();
                    record.endpoint = Some(endpoint);
                    record.profile = Some(profile.clone());
                    record.last_error = None;
                    record.next_seq = 1;
                    record.hotend_on = false;
                    record.bed_on = false;
                    record.session = SessionMark::Idle;
                    record.owner = None;
                }

                if profile.supports_checksum {
                    match self.shared.exchange("M110 N0").await {
                        LineOutcome::Acked(_) => {}
                        _ => warn!("Printer did not acknowledge line number reset"),
                    }
                }

                self.shared.start_poller();
                self.shared.set_state(ConnectionState::Connected);
                Ok(profile)
            }
            Err(e) => {
                error!("Failed to connect: {e}");
                self.shared.record().last_error = Some(e.to_string());
                self.shared.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        target: ConnectTarget,
    ) -> Result<(Box<dyn PrinterTransport>, String, PrinterProfile), CommError> {
        let (endpoint, profile) = match target {
            ConnectTarget::Profile { endpoint, profile } => (endpoint, profile),
            ConnectTarget::Discover {
                candidates,
                per_endpoint_timeout,
            } => {
                let candidates = if candidates.is_empty() {
                    self.shared.connector.available_endpoints()
                } else {
                    candidates
                };
                let resolver = ProfileResolver::new(
                    Arc::clone(&self.shared.connector),
                    Arc::clone(&self.shared.table),
                );
                let device = resolver
                    .discover(&candidates, per_endpoint_timeout)
                    .await
                    .into_iter()
                    .next()
                    .ok_or(CommError::NoDeviceFound)?;
                (device.endpoint, device.profile)
            }
        };

        let transport = tokio::time::timeout(
            self.shared.settings.connect_timeout(),
            self.shared.connector.open(&endpoint),
        )
        .await
        .map_err(|_| CommError::ConnectTimeout(endpoint.clone()))??;
        Ok((transport, endpoint, profile))
    }

    /// Stream a program to the device, one line in flight at a time.
    ///
    /// # Arguments
    ///
    /// * `program` - Lines to send, in order
    /// * `cancel` - Checked between lines; cancelling returns `Cancelled`
    ///
    /// # Returns
    ///
    /// A `StreamReport` with outcome `Completed` (every line acknowledged)
    /// or `Cancelled`. The connection returns to `Connected` in both cases.
    ///
    /// # Errors
    ///
    /// - `Busy` if another stream or a rollback stop owns the connection
    ///   (nothing is queued)
    /// - `NotConnected` unless the connection is `Connected`
    /// - `Stream` on a firmware fault or when a line exhausts its retry
    ///   budget; one emergency stop has been attempted and the connection
    ///   is left in `Error`
    pub async fn stream(
        &self,
        program: &GcodeProgram,
        cancel: &CancelToken,
    ) -> Result<StreamReport, CommError> {
        let abort = self.shared.claim_session(cancel)?;
        let mut guard = SessionGuard {
            shared: &self.shared,
            armed: true,
        };
        self.shared.progress_tx.send_replace(StreamProgress {
            lines_sent: 0,
            total_lines: program.len(),
        });
        self.shared.emit_state(ConnectionState::Streaming);
        info!("Streaming {} line(s) from {}", program.len(), program.source);

        let result = self.shared.run_session(program, cancel, &abort).await;

        // The guard stays armed through any emergency stop below, so a drop
        // there still leaves the connection in `Error`.
        match result {
            Ok(report) if report.outcome == StreamOutcome::Completed => {
                info!("Stream completed: {} line(s)", report.lines_sent);
                self.shared.record().session = SessionMark::Completed;
                guard.armed = false;
                self.shared.set_state(ConnectionState::Connected);
                Ok(report)
            }
            Ok(report) => {
                info!(
                    "Stream cancelled after {}/{} line(s)",
                    report.lines_sent, report.total_lines
                );
                let heating = self.shared.record().heaters_on();
                if heating {
                    self.shared.emergency_stop("stream cancelled while heating").await;
                    self.shared.record().session = SessionMark::SafeStopped;
                } else {
                    self.shared.record().session = SessionMark::Cancelled;
                }
                guard.armed = false;
                self.shared.set_state(ConnectionState::Connected);
                Ok(report)
            }
            Err(e) => {
                error!("{e}");
                self.shared.emergency_stop(&e.to_string()).await;
                {
                    let mut record = self.shared.record();
                    record.session = SessionMark::SafeStopped;
                    record.last_error = Some(e.to_string());
                }
                guard.armed = false;
                self.shared.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Issue the emergency stop if `owner`'s stream ended without one.
    ///
    /// `owner` is the cancel token that was passed to [`stream`](Self::stream).
    /// Nothing is sent when the last session belongs to another caller, when
    /// a stream is running, or when the session completed or already stopped
    /// the machine. Returns whether a stop was sent.
    pub async fn ensure_safe_stop(&self, owner: &CancelToken) -> bool {
        let Some(_claim) = self.shared.claim_safe_stop(owner) else {
            return false;
        };
        self.shared.emergency_stop("workflow rollback").await;
        self.shared.record().session = SessionMark::SafeStopped;
        true
    }

    /// Stop polling, close the transport and return to `Disconnected`.
    ///
    /// An active stream is cancelled first and allowed to wind down.
    pub async fn disconnect(&self) -> Result<(), CommError> {
        loop {
            let mut taken = false;
            {
                // Sessions install their abort token under this lock, so the
                // token cancelled here belongs to the stream that is running.
                let abort = self.shared.lock_abort();
                self.shared.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Streaming {
                        abort.cancel();
                        return false;
                    }
                    taken = true;
                    let changed = *state != ConnectionState::Disconnected;
                    *state = ConnectionState::Disconnected;
                    changed
                });
            }
            if taken {
                break;
            }
            let mut rx = self.shared.state_tx.subscribe();
            let _ = rx.wait_for(|s| *s != ConnectionState::Streaming).await;
        }

        self.shared.stop_poller().await;
        let closed = match self.shared.transport.lock().await.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        };
        {
            let mut record = self.shared.record();
            record.hotend_on = false;
            record.bed_on = false;
        }
        self.shared.emit_state(ConnectionState::Disconnected);
        info!("Disconnected");
        closed.map_err(CommError::from)
    }
}

/// Releases the line claimed by [`Shared::claim_safe_stop`].
struct StopClaim<'a> {
    shared: &'a Shared,
}

impl Drop for StopClaim<'_> {
    fn drop(&mut self) {
        self.shared.record().stopping = false;
    }
}

/// Moves the connection to `Error` if a stream future is dropped mid-session.
struct SessionGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Stream interrupted before it finished");
        {
            let mut record = self.shared.record();
            record.session = SessionMark::Interrupted;
            record.last_error = Some("stream interrupted".to_string());
        }
        self.shared.set_state(ConnectionState::Error);
    }
}

impl Shared {
    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_abort(&self) -> MutexGuard<'_, CancelToken> {
        self.session_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `Connected` to `Streaming` and start a session owned by `owner`.
    ///
    /// The abort token is installed under the same lock that `disconnect`
    /// takes, so a disconnect never cancels a stale token.
    fn claim_session(&self, owner: &CancelToken) -> Result<CancelToken, CommError> {
        let mut slot = self.lock_abort();
        let stopping = self.record().stopping;
        let mut claimed = Ok(());
        self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Connected if stopping => {
                claimed = Err(CommError::Busy);
                false
            }
            ConnectionState::Connected => {
                *state = ConnectionState::Streaming;
                true
            }
            ConnectionState::Streaming => {
                claimed = Err(CommError::Busy);
                false
            }
            other => {
                claimed = Err(CommError::NotConnected(other));
                false
            }
        });
        claimed?;

        let abort = CancelToken::new();
        *slot = abort.clone();
        let mut record = self.record();
        record.session = SessionMark::Active;
        record.owner = Some(owner.clone());
        Ok(abort)
    }

    /// Reserve the line for a rollback stop of `owner`'s unfinished session.
    fn claim_safe_stop(&self, owner: &CancelToken) -> Option<StopClaim<'_>> {
        let _slot = self.lock_abort();
        if *self.state_tx.borrow() == ConnectionState::Streaming {
            return None;
        }
        let mut record = self.record();
        let owned = record.owner.as_ref().is_some_and(|o| o.same_as(owner));
        let unfinished = matches!(
            record.session,
            SessionMark::Active | SessionMark::Cancelled | SessionMark::Interrupted
        );
        if !owned || !unfinished || record.stopping {
            return None;
        }
        record.stopping = true;
        Some(StopClaim { shared: self })
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        self.emit_state(state);
    }

    fn emit_state(&self, state: ConnectionState) {
        let endpoint = self.record().endpoint.clone();
        let _ = self
            .events_tx
            .send(Event::PrinterStateChanged { endpoint, state });
    }

    async fn run_session(
        &self,
        program: &GcodeProgram,
        cancel: &CancelToken,
        abort: &CancelToken,
    ) -> Result<StreamReport, CommError> {
        let total = program.len();
        let framed = self
            .record()
            .profile
            .as_ref()
            .is_some_and(|p| p.supports_checksum);
        let max_retries = self.settings.max_retries;
        let mut resends = 0u32;

        for (index, command) in program.lines().iter().enumerate() {
            if cancel.is_cancelled() || abort.is_cancelled() {
                return Ok(StreamReport {
                    outcome: StreamOutcome::Cancelled,
                    lines_sent: index,
                    total_lines: total,
                    resends,
                });
            }

            let wire = if framed {
                let mut record = self.record();
                let seq = record.next_seq;
                record.next_seq += 1;
                frame_line(seq, command)
            } else {
                command.clone()
            };

            let mut attempts = 0u32;
            let readings = loop {
                match self.exchange(&wire).await {
                    LineOutcome::Acked(readings) => break readings,
                    LineOutcome::TimedOut => {
                        self.record().stats.ack_timeouts += 1;
                        warn!("No ack for line {} ({command}) within timeout", index + 1);
                    }
                    LineOutcome::ResendRequested(n) => {
                        warn!("Device requested resend of line {n}");
                    }
                    LineOutcome::Fault(message) => {
                        self.record().stats.faults += 1;
                        return Err(CommError::Stream {
                            line: index + 1,
                            reason: format!("firmware fault: {message}"),
                        });
                    }
                    LineOutcome::Broken(reason) => {
                        return Err(CommError::Stream {
                            line: index + 1,
                            reason,
                        });
                    }
                }

                if attempts >= max_retries {
                    return Err(CommError::Stream {
                        line: index + 1,
                        reason: format!("no acknowledgment after {max_retries} resend(s)"),
                    });
                }
                attempts += 1;
                resends += 1;
                self.record().stats.resends += 1;
                debug!("Resending line {} (attempt {attempts}/{max_retries})", index + 1);
            };

            let progress = StreamProgress {
                lines_sent: index + 1,
                total_lines: total,
            };
            {
                let mut record = self.record();
                record.stats.lines_sent += 1;
                if let Some(target) = heater_target(command) {
                    let on = target > 0.0;
                    match command_word(command).as_str() {
                        "M140" | "M190" => record.bed_on = on,
                        _ => record.hotend_on = on,
                    }
                }
                if !readings.is_empty() {
                    merge_readings(&mut record.telemetry, readings);
                }
            }
            self.progress_tx.send_replace(progress);
            let _ = self.events_tx.send(Event::StreamProgress {
                lines_sent: progress.lines_sent,
                total_lines: progress.total_lines,
            });
        }

        Ok(StreamReport {
            outcome: StreamOutcome::Completed,
            lines_sent: total,
            total_lines: total,
            resends,
        })
    }

    /// Send one line and wait for its acknowledgment.
    ///
    /// Holds the transport for the whole exchange so the telemetry poller
    /// can only slip in between lines.
    async fn exchange(&self, wire: &str) -> LineOutcome {
        let mut guard = self.transport.lock().await;
        let Some(transport) = guard.as_mut() else {
            return LineOutcome::Broken("transport is closed".to_string());
        };

        if let Err(e) = transport.write_line(wire).await {
            return LineOutcome::Broken(e.to_string());
        }
        debug!(">> {wire}");

        let ack_timeout = self.settings.ack_timeout();
        let mut deadline = Instant::now() + ack_timeout;
        let mut resend_requested = None;
        loop {
            let line = match tokio::time::timeout_at(deadline, transport.read_line()).await {
                Err(_) => {
                    return match resend_requested {
                        Some(n) => LineOutcome::ResendRequested(n),
                        None => LineOutcome::TimedOut,
                    }
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    return LineOutcome::Broken("device closed the connection".to_string())
                }
                Ok(Err(e)) => return LineOutcome::Broken(e.to_string()),
            };
            debug!("<< {line}");

            match parse_response(&line) {
                // Marlin follows a resend request with an `ok` for the rejected line.
                DeviceResponse::Ack(readings) => {
                    return match resend_requested {
                        Some(n) => LineOutcome::ResendRequested(n),
                        None => LineOutcome::Acked(readings),
                    }
                }
                DeviceResponse::Resend(n) => resend_requested = Some(n),
                DeviceResponse::Busy => deadline = Instant::now() + ack_timeout,
                DeviceResponse::LineError(message) => warn!("Device rejected line: {message}"),
                DeviceResponse::Fault(message) => return LineOutcome::Fault(message),
                DeviceResponse::Report(readings) => {
                    merge_readings(&mut self.record().telemetry, readings);
                }
                DeviceResponse::Info(_) => {}
            }
        }
    }

    /// Cease heating, park if supported and release the motors.
    ///
    /// Best effort: every command is sent once and its ack waited for once.
    async fn emergency_stop(&self, reason: &str) {
        warn!("Emergency stop: {reason}");
        let parking = self
            .record()
            .profile
            .as_ref()
            .is_some_and(|p| p.supports_parking);

        let mut sequence = vec!["M104 S0", "M140 S0", "M107"];
        if parking {
            sequence.extend(["G91", "G1 Z10 F600", "G90", "G28 X Y"]);
        }
        sequence.push("M84");

        {
            let mut guard = self.transport.lock().await;
            if let Some(transport) = guard.as_mut() {
                for command in sequence {
                    if let Err(e) = transport.write_line(command).await {
                        warn!("Emergency stop interrupted: {e}");
                        break;
                    }
                    debug!(">> {command}");
                    let mut ignored = Readings::default();
                    collect_until_ack(transport.as_mut(), self.settings.ack_timeout(), &mut ignored)
                        .await;
                }
            }
        }

        let mut record = self.record();
        record.stats.safe_stops += 1;
        record.hotend_on = false;
        record.bed_on = false;
    }

    fn start_poller(self: &Arc<Self>) {
        let stop = CancelToken::new();
        let weak = Arc::downgrade(self);
        let period = self.settings.telemetry_interval();
        let handle = tokio::spawn(poll_telemetry(weak, period, stop.clone()));
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((stop, handle));
        if let Some((old_stop, _)) = previous {
            old_stop.cancel();
        }
    }

    async fn stop_poller(&self) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((stop, handle)) = poller {
            stop.cancel();
            let _ = handle.await;
        }
    }

    async fn poll_once(&self) {
        let mut readings = Readings::default();
        {
            let mut guard = self.transport.lock().await;
            let Some(transport) = guard.as_mut() else {
                return;
            };
            for query in ["M105", "M114"] {
                if let Err(e) = transport.write_line(query).await {
                    debug!("Telemetry query failed: {e}");
                    return;
                }
                collect_until_ack(transport.as_mut(), self.settings.ack_timeout(), &mut readings)
                    .await;
            }
        }
        if readings.is_empty() {
            return;
        }

        let telemetry = {
            let mut record = self.record();
            merge_readings(&mut record.telemetry, readings);
            record.telemetry.clone()
        };
        let _ = self.events_tx.send(Event::PrinterTelemetry { telemetry });
    }
}

async fn poll_telemetry(shared: Weak<Shared>, period: Duration, stop: CancelToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // An exchange is never abandoned halfway, or its `ok` would be
        // taken as the ack of the next streamed line.
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if stop.is_cancelled() {
            break;
        }
        let state = *shared.state_tx.borrow();
        if matches!(state, ConnectionState::Connected | ConnectionState::Streaming) {
            shared.poll_once().await;
        }
    }
    debug!("Telemetry poller stopped");
}

/// Read lines until `ok`, a fault or the timeout, merging any readings.
async fn collect_until_ack(
    transport: &mut dyn PrinterTransport,
    ack_timeout: Duration,
    readings: &mut Readings,
) {
    let mut deadline = Instant::now() + ack_timeout;
    loop {
        let line = match tokio::time::timeout_at(deadline, transport.read_line()).await {
            Ok(Ok(Some(line))) => line,
            _ => return,
        };
        match parse_response(&line) {
            DeviceResponse::Ack(found) | DeviceResponse::Report(found) => {
                let done = line.trim_start().starts_with("ok");
                readings.temperatures.extend(found.temperatures);
                readings.position.extend(found.position);
                if done {
                    return;
                }
            }
            DeviceResponse::Busy => deadline = Instant::now() + ack_timeout,
            DeviceResponse::Fault(_) => return,
            _ => {}
        }
    }
}

fn merge_readings(telemetry: &mut Telemetry, readings: Readings) {
    telemetry.temperatures.extend(readings.temperatures);
    telemetry.position.extend(readings.position);
    telemetry.updated_at = Some(Utc::now());
}
