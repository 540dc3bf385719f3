//! [`DeviceSession`] – the single owner of the sensor board's serial port.
//!
//! # State machine
//!
//! ```text
//! Idle ──connect()──▶ Opening ──open ok──▶ Open ──shutdown()──▶ Closing ──▶ Idle
//!   ▲                    │                   │
//!   └──── not found ─────┘                   │
//!   └──── open error ──── Faulted ◀── I/O error / EOF
//! ```
//!
//! While `Open`, a reader task frames the byte stream on CRLF, classifies each
//! line with [`protocol::parse`], range-checks distance values, and emits
//! [`SessionEvent`]s.  A writer task owns the write half; commands reach it
//! over an unbounded channel, so [`DeviceSession::send_command`] never blocks
//! and only one task ever writes to the port.
//!
//! There is no retry loop here.  After a fault the session idles until a
//! caller invokes `connect()` again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magcue_types::{ActuatorCommand, DistanceReading, RelayError};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Span, debug, error, info, instrument, trace, warn};

use crate::framing::{LineRead, MAX_LINE_BYTES, read_crlf_line};
use crate::link::DeviceLink;
use crate::locator::{self, PortDescriptor, PortEnumerator, SystemPorts, default_signatures};
use crate::protocol::{self, ParsedLine};
use crate::transport::{SerialConnector, TokioSerialConnector};

/// Baud rate the sensor firmware is flashed with.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Lifecycle of the serial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Open,
    Closing,
    Faulted,
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The device connection went up (`true`) or down (`false`).
    Status(bool),
    /// An in-range distance reading.
    Reading(DistanceReading),
}

/// How the session finds and opens the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub baud_rate: u32,
    /// Manufacturer substrings accepted by the locator.
    pub vendor_signatures: Vec<String>,
    /// Open this path directly instead of running the locator.
    pub port_override: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            vendor_signatures: default_signatures(),
            port_override: None,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub port: Option<String>,
    /// Last level actually written to the wire.
    pub last_commanded_level: u8,
    /// When the last complete line arrived from the device.
    pub last_line_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }
}

enum WriteRequest {
    Command(ActuatorCommand),
    /// Write level 0, report the outcome, then stop.
    FinalZero(oneshot::Sender<Result<(), RelayError>>),
}

struct Inner {
    state: SessionState,
    port: Option<String>,
    /// Bumped on every open and close so stale I/O tasks can tell they lost
    /// ownership of the session.
    generation: u64,
    writer: Option<mpsc::UnboundedSender<WriteRequest>>,
    writer_task: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    last_commanded_level: u8,
    last_line_at: Option<DateTime<Utc>>,
}

struct Shared {
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Mutex<Inner>,
}

impl Shared {
    // Called with `inner` locked so events leave in state-transition order.
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("session event receiver dropped");
        }
    }

    fn handle_line(&self, generation: u64, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let observed_at = Utc::now();
        let parsed = protocol::parse(&text);

        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != SessionState::Open {
            return;
        }
        inner.last_line_at = Some(observed_at);

        match parsed {
            ParsedLine::DistanceLine { percent } => {
                match DistanceReading::new(percent, observed_at) {
                    Ok(reading) => {
                        trace!(percent, "distance reading");
                        self.emit(SessionEvent::Reading(reading));
                    }
                    Err(err) => {
                        warn!(percent, error = %err, "dropping out-of-range distance reading");
                    }
                }
            }
            ParsedLine::InfoLine { text } => debug!(line = %text, "device info line"),
            ParsedLine::Unrecognized { raw } => debug!(line = %raw, "device line is not telemetry"),
        }
    }

    fn record_level(&self, generation: u64, command: ActuatorCommand) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.last_commanded_level = command.level();
        }
    }

    /// `Open → Faulted → Idle`, exactly once per generation.
    fn fault(&self, generation: u64, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != SessionState::Open {
            return;
        }
        inner.state = SessionState::Faulted;
        error!(port = ?inner.port, reason, "device session faulted");

        inner.writer = None;
        inner.writer_task = None;
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        inner.port = None;
        inner.state = SessionState::Idle;
        self.emit(SessionEvent::Status(false));
    }
}

/// Returns a session still marked `Opening` to `Idle` when `connect` is
/// dropped before it finished.
struct OpeningGuard<'a> {
    shared: &'a Shared,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == SessionState::Opening {
            debug!("connect cancelled while opening");
            inner.port = None;
            inner.state = SessionState::Idle;
        }
    }
}

/// The live owner of the physical serial connection.
///
/// Construct one per process and hand it to the relay hub; the hub is then
/// the only caller of its methods.
pub struct DeviceSession {
    config: SessionConfig,
    ports: Arc<dyn PortEnumerator>,
    connector: Arc<dyn SerialConnector>,
    shared: Arc<Shared>,
}

impl DeviceSession {
    /// A session backed by the host's real serial ports.
    ///
    /// Returns the session and the receiver for its [`SessionEvent`]s.
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_backends(config, Arc::new(SystemPorts), Arc::new(TokioSerialConnector))
    }

    /// A session with explicit port enumeration and open backends.
    pub fn with_backends(
        config: SessionConfig,
        ports: Arc<dyn PortEnumerator>,
        connector: Arc<dyn SerialConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                port: None,
                generation: 0,
                writer: None,
                writer_task: None,
                reader: None,
                last_commanded_level: 0,
                last_line_at: None,
            }),
        });
        let session = Self {
            config,
            ports,
            connector,
            shared,
        };
        (session, receiver)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn resolve_port(&self) -> Result<PortDescriptor, RelayError> {
        if let Some(path) = &self.config.port_override {
            return Ok(PortDescriptor::from_path(path.clone()));
        }
        locator::locate(self.ports.as_ref(), &self.config.vendor_signatures)?
            .ok_or(RelayError::DeviceNotFound)
    }

    fn settle_idle(&self, faulted: bool) {
        let mut inner = self.shared.inner.lock();
        if faulted {
            inner.state = SessionState::Faulted;
            debug!("session faulted while opening");
        }
        inner.port = None;
        inner.state = SessionState::Idle;
        self.shared.emit(SessionEvent::Status(false));
    }
}

#[async_trait]
impl DeviceLink for DeviceSession {
    #[instrument(skip(self), fields(port = tracing::field::Empty))]
    async fn connect(&self) -> Result<(), RelayError> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Open | SessionState::Opening => {
                    debug!(state = ?inner.state, "connect ignored; session already active");
                    return Ok(());
                }
                SessionState::Closing => {
                    return Err(RelayError::Channel("device session is closing".to_string()));
                }
                SessionState::Idle | SessionState::Faulted => {}
            }
            // Opening doubles as the in-flight guard while the port is located.
            inner.state = SessionState::Opening;
        }
        let _opening = OpeningGuard { shared: &self.shared };

        let descriptor = match self.resolve_port() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                match &err {
                    RelayError::DeviceNotFound => {
                        warn!(signatures = ?self.config.vendor_signatures, "no serial port matched a known device");
                    }
                    other => error!(error = %other, "serial port enumeration failed"),
                }
                self.settle_idle(false);
                return Err(err);
            }
        };

        Span::current().record("port", descriptor.path.as_str());
        info!(
            manufacturer = ?descriptor.manufacturer,
            "opening device port"
        );
        let stream = match self.connector.open(&descriptor.path, self.config.baud_rate).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(port = %descriptor.path, error = %err, "failed to open device port");
                self.settle_idle(true);
                return Err(err);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.state = SessionState::Open;
            inner.port = Some(descriptor.path.clone());
            inner.writer = Some(write_tx);
            self.shared.emit(SessionEvent::Status(true));
            inner.generation
        };
        info!(baud = self.config.baud_rate, "device session open");

        let writer = tokio::spawn(write_loop(Arc::clone(&self.shared), generation, write_half, write_rx));
        let reader = tokio::spawn(read_loop(Arc::clone(&self.shared), generation, read_half));

        let mut inner = self.shared.inner.lock();
        if inner.generation == generation && inner.state == SessionState::Open {
            inner.writer_task = Some(writer);
            inner.reader = Some(reader);
        }
        Ok(())
    }

    fn send_command(&self, command: ActuatorCommand) {
        let inner = self.shared.inner.lock();
        match (inner.state, &inner.writer) {
            (SessionState::Open, Some(writer)) => {
                if writer.send(WriteRequest::Command(command)).is_err() {
                    warn!(level = command.level(), "device writer stopped; dropping actuator command");
                }
            }
            (state, _) => {
                warn!(?state, level = command.level(), "device session not open; dropping actuator command");
            }
        }
    }

    #[instrument(skip_all, fields(wait_ms = wait.as_millis() as u64))]
    async fn shutdown(&self, wait: Duration) {
        let writer = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Open {
                debug!(state = ?inner.state, "shutdown: no open device session");
                return;
            }
            inner.state = SessionState::Closing;
            inner.writer.take()
        };
        info!("closing device session; de-energising actuator");

        if let Some(writer) = writer {
            let (done_tx, done_rx) = oneshot::channel();
            if writer.send(WriteRequest::FinalZero(done_tx)).is_ok() {
                match tokio::time::timeout(wait, done_rx).await {
                    Ok(Ok(Ok(()))) => info!("actuator de-energised"),
                    Ok(Ok(Err(err))) => warn!(error = %err, "final zero command failed"),
                    Ok(Err(_)) => warn!("device writer stopped before the final zero command"),
                    Err(_) => warn!("timed out waiting for the final zero command"),
                }
            }
        }

        let mut inner = self.shared.inner.lock();
        // A writer stalled on a full port buffer is abandoned.
        if let Some(writer_task) = inner.writer_task.take() {
            writer_task.abort();
        }
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        inner.generation += 1;
        inner.port = None;
        inner.state = SessionState::Idle;
        self.shared.emit(SessionEvent::Status(false));
    }

    fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.lock();
        SessionSnapshot {
            state: inner.state,
            port: inner.port.clone(),
            last_commanded_level: inner.last_commanded_level,
            last_line_at: inner.last_line_at,
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, generation: u64, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(128);
    loop {
        match read_crlf_line(&mut reader, &mut line).await {
            Ok(LineRead::Line) => shared.handle_line(generation, &line),
            Ok(LineRead::Overflow) => {
                warn!(max_bytes = MAX_LINE_BYTES, "discarding oversized device line");
            }
            Ok(LineRead::Eof) => {
                shared.fault(generation, "device closed the serial stream");
                return;
            }
            Err(err) => {
                shared.fault(generation, &err.to_string());
                return;
            }
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    generation: u64,
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = requests.recv().await {
        match request {
            WriteRequest::Command(command) => match write_command(&mut writer, command).await {
                Ok(()) => {
                    shared.record_level(generation, command);
                    debug!(level = command.level(), "sent actuator command");
                }
                Err(err) => {
                    shared.fault(generation, &err.to_string());
                    return;
                }
            },
            WriteRequest::FinalZero(done) => {
                let result = write_command(&mut writer, ActuatorCommand::OFF).await;
                if result.is_ok() {
                    shared.record_level(generation, ActuatorCommand::OFF);
                }
                let _ = done.send(result);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_command<W>(writer: &mut W, command: ActuatorCommand) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(command.wire_line().as_bytes())
        .await
        .map_err(|e| RelayError::Io(e.to_string()))?;
    writer.flush().await.map_err(|e| RelayError::Io(e.to_string()))
}
